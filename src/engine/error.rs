use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("conflict with reservation: {0}")]
    Conflict(Ulid),
    #[error("resource {0} is under maintenance")]
    ResourceUnavailable(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("commit task failed: {0}")]
    TaskFailed(String),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Worth retrying unchanged: the store was busy or unreachable, not
    /// the request wrong.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout(_) | EngineError::TaskFailed(_) | EngineError::WalError(_)
        )
    }
}
