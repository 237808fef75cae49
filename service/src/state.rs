//! Wallet service state definitions.

/// Service operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created, background tasks not started.
    Starting,
    /// Running and accepting requests.
    Running,
    /// Shutting down, not accepting new requests.
    ShuttingDown,
    /// Background tasks stopped.
    Stopped,
}

impl ServiceState {
    /// Check if the service is accepting new requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// Check if the service is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped)
    }
}
