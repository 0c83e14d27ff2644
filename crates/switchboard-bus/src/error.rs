use std::time::Duration;

use switchboard_core::CoordinatorError;

#[derive(Clone, Debug, thiserror::Error)]
pub enum BusError {
    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("service not reachable: {0}")]
    Unreachable(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("registration rejected: {0}")]
    Rejected(String),
}

impl From<BusError> for CoordinatorError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Timeout { command, after } => CoordinatorError::Timeout { command, after },
            BusError::Remote(msg) => CoordinatorError::Remote(msg),
            other => CoordinatorError::Transport(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamError {
    #[error("no such consumer group {group} on stream {stream}")]
    NoGroup { stream: String, group: String },
    #[error("stream backend error: {0}")]
    Backend(String),
}
