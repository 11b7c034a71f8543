use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::LimitExceeded("interval must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// First active reservation on `rs` whose occupied span intersects `span`,
/// ignoring `exclude` (the row being modified).
pub(crate) fn find_conflict(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.overlapping(span)
        .find(|(r, _)| Some(r.id) != exclude)
        .map(|(r, _)| r.id)
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude) {
        Some(id) => Err(EngineError::Conflict(id)),
        None => Ok(()),
    }
}
