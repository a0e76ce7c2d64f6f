use thiserror::Error;

/// Recorder error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecorderError {
    #[error("Session already running")]
    AlreadyRunning,

    #[error("Session not running")]
    NotRunning,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Signal source failed: {0}")]
    SignalSource(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for recorder operations
pub type RResult<T> = Result<T, RecorderError>;
