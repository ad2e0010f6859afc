use thiserror::Error;
use ulid::Ulid;

use crate::schedule::Rejection;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("unknown timezone: {0:?}")]
    InvalidTimezone(String),

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    /// The scheduling rejection behind this error, if there is one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            EngineError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

/// The store found an existing scheduled appointment overlapping the one
/// about to be written. Raised under the provider's write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExclusionViolation {
    pub existing: Ulid,
}

impl From<ExclusionViolation> for EngineError {
    fn from(_: ExclusionViolation) -> Self {
        EngineError::Rejected(Rejection::BookingConflict)
    }
}
