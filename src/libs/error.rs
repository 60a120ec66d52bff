use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by the PMDT library.
///
/// Run-time violations (threshold crossings, trapped bus errors, transaction
/// timeouts) are not represented here. They originate in hardware and are
/// reported through [`crate::libs::isr::ErrorReport`].
#[derive(Debug, Error)]
pub enum PmdtError {
    /// More monitors, trace engines, counters or trackers requested than the
    /// unit implements.
    #[error("Insufficient {resource}: need {requested}, unit implements {available}")]
    InsufficientResources {
        resource: &'static str,
        requested: usize,
        available: usize,
    },

    /// Features request directions the unit cannot serve at the same time.
    #[error("Incompatible direction requirements: {0}")]
    DirectionConflict(String),

    /// A configuration field is outside its legal range or ordering.
    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// An index (counter, tracker, state, unit) exceeds what is implemented.
    #[error("{what} {index} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },

    /// A polled completion flag was not observed within the deadline.
    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },

    /// A sample overlapped a window boundary. Retry the read.
    #[error("Sample overlapped a window boundary, retry")]
    Busy,

    /// The trace engine is running or locked.
    #[error("Trace engine {0} is running or locked")]
    Permission(u8),

    #[error("Unit {0} is not in the unit map")]
    UnknownUnit(u8),

    #[error("Unit {0} has not been configured")]
    NotConfigured(u8),

    #[error("Unit map line {line}: {reason}")]
    UnitMap { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PmdtError>;

impl PmdtError {
    /// Configuration errors abort a unit's setup as a whole.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PmdtError::InsufficientResources { .. }
                | PmdtError::DirectionConflict(_)
                | PmdtError::InvalidField { .. }
                | PmdtError::OutOfRange { .. }
        )
    }

    /// Errors a caller may clear by simply retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PmdtError::Busy)
    }
}

pub(crate) fn out_of_range(what: &'static str, index: usize, limit: usize) -> PmdtError {
    PmdtError::OutOfRange { what, index, limit }
}

pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> PmdtError {
    PmdtError::InvalidField {
        field,
        reason: reason.into(),
    }
}
