use std::time::Duration;

/// Typed error hierarchy for coordinator operations.
/// Classifies errors as not-found, capacity, transport, or protocol failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CoordinatorError {
    // Not found
    #[error("tenant not found: {0}")]
    TenantNotFound(String),
    #[error("participant not found: {0}")]
    ParticipantNotFound(String),
    #[error("unknown media bridge: {0}")]
    UnknownWorker(String),
    #[error("connection {0} sent an answer before joining")]
    AnswerBeforeJoin(u64),
    #[error("participant {0} has no media bridge assigned yet")]
    NoBackendBound(String),

    // Capacity
    #[error("there isn't any available media bridge")]
    NoBackendAvailable,

    // Transport
    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("request to media bridge {worker} failed: {source}")]
    RequestFailed {
        worker: String,
        #[source]
        source: Box<CoordinatorError>,
    },

    // Protocol
    #[error("unknown service type: {0}")]
    UnknownServiceType(String),
    #[error("incompatible caller type {actual} for {command}")]
    IncompatibleCaller { command: String, actual: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid service descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("invalid connection state: {0}")]
    InvalidConnectionState(String),
}

impl CoordinatorError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TenantNotFound(_)
                | Self::ParticipantNotFound(_)
                | Self::UnknownWorker(_)
                | Self::AnswerBeforeJoin(_)
                | Self::NoBackendBound(_)
        )
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::NoBackendAvailable)
    }

    pub fn is_transport(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) | Self::Remote(_) => true,
            Self::RequestFailed { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnknownServiceType(_)
                | Self::IncompatibleCaller { .. }
                | Self::UnknownMessageType(_)
                | Self::InvalidMessage(_)
                | Self::InvalidDescriptor(_)
                | Self::InvalidConnectionState(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TenantNotFound(_) => "tenant_not_found",
            Self::ParticipantNotFound(_) => "participant_not_found",
            Self::UnknownWorker(_) => "unknown_worker",
            Self::AnswerBeforeJoin(_) => "answer_before_join",
            Self::NoBackendBound(_) => "no_backend_bound",
            Self::NoBackendAvailable => "no_backend_available",
            Self::Timeout { .. } => "timeout",
            Self::Transport(_) => "transport",
            Self::Remote(_) => "remote",
            Self::RequestFailed { .. } => "request_failed",
            Self::UnknownServiceType(_) => "unknown_service_type",
            Self::IncompatibleCaller { .. } => "incompatible_caller",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::InvalidMessage(_) => "invalid_message",
            Self::InvalidDescriptor(_) => "invalid_descriptor",
            Self::InvalidConnectionState(_) => "invalid_connection_state",
        }
    }
}
