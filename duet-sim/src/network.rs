//! In-memory FIFO links with random per-message latency.
//!
//! ```text
//! send ──► unbounded queue ──► forwarder task ──sleep(0..=max)──► receiver
//! ```
//!
//! One forwarder per link delivers messages in order, so every link behaves
//! like a slow TCP stream.

use std::time::Duration;

use duet_collab::{ChecksumActivity, ChecksumVerdict, DocPath};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Client → host.
#[derive(Debug)]
pub enum Upstream {
    /// Encoded `Activity`
    Activity(Vec<u8>),
    /// The client detected divergence and dropped its channel for `path`.
    Resync { client: Uuid, path: DocPath },
    /// How the client judged a checksum it received.
    Verdict {
        client: Uuid,
        checksum: ChecksumActivity,
        verdict: ChecksumVerdict,
    },
    /// The client made all its edits.
    Done(Uuid),
}

/// Host → client.
#[derive(Debug)]
pub enum Downstream {
    /// Encoded `Activity`
    Activity(Vec<u8>),
    /// Canonical content after a resync; the channel restarts from here.
    Snapshot { path: DocPath, content: String },
    /// The host could not apply the client's edit and dropped its channel.
    Diverged { path: DocPath },
    Shutdown,
}

pub struct DelayedLink<T> {
    queue: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> DelayedLink<T> {
    /// Spawn the forwarder into `out`.
    pub fn spawn(out: mpsc::UnboundedSender<T>, max_delay: Duration, seed: u64) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<T>();
        let max_micros = max_delay.as_micros() as u64;

        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            while let Some(msg) = rx.recv().await {
                let delay = rng.gen_range(0..=max_micros);
                tokio::time::sleep(Duration::from_micros(delay)).await;
                if out.send(msg).is_err() {
                    break;
                }
            }
        });

        Self { queue }
    }

    /// Returns false once the far end is gone.
    pub fn send(&self, msg: T) -> bool {
        self.queue.send(msg).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_preserves_order() {
        let (out, mut rx) = mpsc::unbounded_channel();
        let link = DelayedLink::spawn(out, Duration::from_millis(2), 7);

        for i in 0..50 {
            assert!(link.send(i));
        }
        for i in 0..50 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (out, rx) = mpsc::unbounded_channel();
        let link = DelayedLink::spawn(out, Duration::ZERO, 1);
        drop(rx);

        // The forwarder notices on its first delivery and exits
        link.send(1u8);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!link.send(2u8));
    }
}
