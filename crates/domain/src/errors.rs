use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Invalid TodoId: {0}")]
    InvalidTodoId(String),

    #[error("Invalid UserId: {0}")]
    InvalidUserId(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid change event: {0}")]
    InvalidEvent(String),

    #[error("Owner mismatch: expected {expected}, got {actual}")]
    OwnerMismatch { expected: String, actual: String },
}
