use thiserror::Error;

/// Every way the scheduling core can turn a request down.
///
/// The set is closed: callers match on it and translate to their own
/// transport. Nothing in here knows about SQLSTATEs or status codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid time of day: {0:?} (expected HH:MM, 00:00..23:59)")]
    InvalidTimeOfDay(String),

    #[error("invalid availability window: end {end} is not after start {start}")]
    InvalidWindow { start: String, end: String },

    #[error("invalid weekday: {0} (expected 1=Monday .. 7=Sunday)")]
    InvalidWeekday(i64),

    #[error("invalid duration: {0} minutes (must be > 0)")]
    InvalidDuration(i64),

    #[error("invalid service duration: {0} minutes")]
    InvalidServiceDuration(i64),

    #[error("clinic has no timezone configured")]
    MissingTimezone,

    #[error("start time must be RFC 3339 with an explicit offset, got {0:?}")]
    AmbiguousTimestamp(String),

    #[error("cannot book a past time")]
    PastBooking,

    #[error("requested time is outside provider availability")]
    OutsideAvailability,

    #[error("time overlaps an existing appointment")]
    BookingConflict,

    #[error("appointment cannot be cancelled")]
    NotCancellable,

    #[error("forbidden")]
    Forbidden,

    #[error("authentication required")]
    Unauthenticated,
}

impl Rejection {
    /// Stable machine-readable code, independent of the message text.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Rejection::InvalidTimeOfDay(_) => "invalid_time_of_day",
            Rejection::InvalidWindow { .. } => "invalid_window",
            Rejection::InvalidWeekday(_) => "invalid_weekday",
            Rejection::InvalidDuration(_) => "invalid_duration",
            Rejection::InvalidServiceDuration(_) => "invalid_service_duration",
            Rejection::MissingTimezone => "missing_timezone",
            Rejection::AmbiguousTimestamp(_) => "ambiguous_timestamp",
            Rejection::PastBooking => "past_booking",
            Rejection::OutsideAvailability => "outside_availability",
            Rejection::BookingConflict => "booking_conflict",
            Rejection::NotCancellable => "not_cancellable",
            Rejection::Forbidden => "forbidden",
            Rejection::Unauthenticated => "unauthenticated",
        }
    }
}
