use serde::{Deserialize, Serialize};
use std::fmt;

/// Two-entry vector clock of one Jupiter channel.
///
/// `local` counts operations generated at this site, `remote` counts
/// operations received from the other end. Both only ever grow until the
/// channel is reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub local: u64,
    pub remote: u64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { local: 0, remote: 0 };

    pub fn new(local: u64, remote: u64) -> Self {
        Self { local, remote }
    }

    pub fn increment_local(self) -> Self {
        Self {
            local: self.local + 1,
            ..self
        }
    }

    pub fn increment_remote(self) -> Self {
        Self {
            remote: self.remote + 1,
            ..self
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment() {
        let t = Timestamp::ZERO.increment_local().increment_local().increment_remote();
        assert_eq!(t, Timestamp::new(2, 1));
        assert_eq!(t.to_string(), "[2,1]");
    }

    #[test]
    fn test_default_is_zero() {
        assert_eq!(Timestamp::default(), Timestamp::ZERO);
    }
}
