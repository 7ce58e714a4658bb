use thiserror::Error;

/// Top-level error type for Courier.
#[derive(Debug, Error)]
pub enum CourierError {
    /// Persistence failure or a corrupt document on disk.
    #[error("storage error: {0}")]
    Storage(String),

    /// A job referenced an avatar with no live platform session.
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    /// Error from the platform handler.
    #[error("platform error: {0}")]
    Platform(String),

    /// An auth operation that is invalid for the current flow state.
    /// Rejected synchronously, before any side effect.
    #[error("auth state error: {0}")]
    AuthState(String),

    /// Backend transport failure. Logged and retried on the next tick.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed input, rejected before any mutation.
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CourierError {
    /// Stable tag used in execution reports and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage_error",
            Self::SessionUnavailable(_) => "session_unavailable",
            Self::Platform(_) => "platform_error",
            Self::AuthState(_) => "auth_state_error",
            Self::Network(_) => "network_error",
            Self::Validation(_) => "validation_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}
