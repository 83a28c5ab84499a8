use tokio::sync::watch;

/// Whether background session work may touch documents right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    /// A session-wide operation (e.g. a resynchronization) holds documents.
    Blocked,
}

/// Owned by the session. Subscribers read the state at the start of each
/// unit of work and skip it while blocked.
#[derive(Debug)]
pub struct ExecutionGate {
    state: watch::Sender<ExecutionState>,
}

impl ExecutionGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ExecutionState::Running);
        Self { state }
    }

    pub fn block(&self) {
        if self.state.send_replace(ExecutionState::Blocked) == ExecutionState::Running {
            log::debug!("Execution blocked");
        }
    }

    pub fn unblock(&self) {
        if self.state.send_replace(ExecutionState::Running) == ExecutionState::Blocked {
            log::debug!("Execution unblocked");
        }
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.state.subscribe()
    }
}

impl Default for ExecutionGate {
    fn default() -> Self {
        Self::new()
    }
}
