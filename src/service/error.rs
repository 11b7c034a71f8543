use thiserror::Error;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::policy::Violation;
use crate::suggest::Suggestions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another active reservation holds part of the interval.
    Overlap,
    /// The resource is under maintenance.
    ResourceUnavailable,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::Overlap => f.write_str("the requested interval is already reserved"),
            ConflictReason::ResourceUnavailable => f.write_str("the resource is under maintenance"),
        }
    }
}

/// The body of an availability rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub reason: ConflictReason,
    /// The reservation that won, when the loss was to an overlap.
    pub conflicting: Option<Ulid>,
    pub suggestions: Suggestions,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(#[from] Violation),
    #[error("conflict: {}", .0.reason)]
    Conflict(Box<Conflict>),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("not permitted")]
    Unauthorized,
    #[error("temporarily unavailable: {0}")]
    Transient(String),
}

impl ServiceError {
    /// Safe to resubmit unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }

    pub(crate) fn conflict(reason: ConflictReason, conflicting: Option<Ulid>) -> Self {
        ServiceError::Conflict(Box::new(Conflict {
            reason,
            conflicting,
            suggestions: Suggestions::default(),
        }))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Unauthorized => "unauthorized",
            ServiceError::Transient(_) => "transient",
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(id) => ServiceError::NotFound(id),
            EngineError::AlreadyExists(id) => ServiceError::Validation(Violation::AlreadyExists(id)),
            EngineError::Conflict(id) => ServiceError::conflict(ConflictReason::Overlap, Some(id)),
            EngineError::ResourceUnavailable(_) => {
                ServiceError::conflict(ConflictReason::ResourceUnavailable, None)
            }
            EngineError::LimitExceeded(msg) => ServiceError::Validation(Violation::Limit(msg)),
            e @ (EngineError::Timeout(_) | EngineError::TaskFailed(_) | EngineError::WalError(_)) => {
                ServiceError::Transient(e.to_string())
            }
        }
    }
}
