use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    ListenerBindFailure {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to connect to {target}: {reason}")]
    ForwardConnectFailure { target: String, reason: String },
}

impl ForwardError {
    /// Short taxonomy name, used when errors cross the IPC boundary
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::ListenerBindFailure { .. } => "listener_bind_failure",
            ForwardError::ForwardConnectFailure { .. } => "forward_connect_failure",
        }
    }
}
