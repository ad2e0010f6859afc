use chrono::{DateTime, Utc};

use crate::model::*;
use crate::schedule::AppointmentStatus;

use super::error::ExclusionViolation;
use super::EngineError;

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// The `(provider, time range)` exclusion constraint: no two scheduled
/// appointments of one provider may overlap. Caller holds the write lock.
pub(crate) fn check_exclusion(ps: &ProviderState, span: &Span) -> Result<(), ExclusionViolation> {
    match ps
        .overlapping(span)
        .find(|a| a.status == AppointmentStatus::Scheduled)
    {
        Some(existing) => Err(ExclusionViolation { existing: existing.id }),
        None => Ok(()),
    }
}
