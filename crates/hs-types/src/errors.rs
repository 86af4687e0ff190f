use thiserror::Error;

use crate::events::{EventId, ExperimentId};
use crate::operations::RequestId;

/// Main error type for the search runner
#[derive(Error, Debug)]
pub enum HsError {
    #[error("Algorithm error: {0}")]
    Algorithm(#[from] AlgorithmError),

    #[error("Remote service error: {0}")]
    Service(#[from] ServiceError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Incompatible {what} state: expected version {expected}, found {found}")]
    StateVersion {
        what: String,
        expected: u32,
        found: u32,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl HsError {
    /// Whether the failure came from the search method rather than a collaborator.
    pub fn is_algorithm(&self) -> bool {
        matches!(self, HsError::Algorithm(_))
    }
}

/// Failures raised by a search method callback. Always fatal to the run.
#[derive(Error, Debug)]
pub enum AlgorithmError {
    #[error("Invalid search method configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Event for unknown trial: {request_id}")]
    UnknownTrial { request_id: RequestId },

    #[error("Search method emitted an invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Search method state error: {message}")]
    State { message: String },

    #[error("Incompatible search method state: expected version {expected}, found {found}")]
    StateVersion { expected: u32, found: u32 },
}

/// Errors surfaced by the remote experiment service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("operation rejected for event {event_id}: {reason}")]
    Rejected { event_id: EventId, reason: String },

    #[error("experiment not found: {experiment_id}")]
    ExperimentNotFound { experiment_id: ExperimentId },

    #[error("remote service internal error: {message}")]
    Internal { message: String },
}

impl ServiceError {
    /// Transient failures are retried by the runner and never reach the search method.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Transport { .. } | ServiceError::RateLimited { .. }
        )
    }
}

/// Result alias for remote service calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors from the durability collaborator
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("snapshot not found: {handle}")]
    NotFound { handle: String },

    #[error("snapshot corrupted: {message}")]
    Corrupt { message: String },

    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint storage error: {message}")]
    Backend { message: String },
}

/// Result type alias for search runner operations
pub type HsResult<T> = Result<T, HsError>;

/// Result type alias for search method callbacks
pub type AlgorithmResult<T> = Result<T, AlgorithmError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HsError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HsError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HsError::Config(format!($($arg)*))
    };
}
