use chrono::{DateTime, Datelike, FixedOffset, Utc};
use chrono_tz::Tz;
use ulid::Ulid;

use super::overlap::{overlaps_any, BookedInterval};
use super::slots::step_for;
use super::time_of_day::iso_weekday;
use super::window::{day_start, resolve, AvailabilityWindow};
use super::Rejection;

/// Parse a client-supplied start time. Only RFC 3339 with an explicit offset
/// (`Z` or `±HH:MM`) is accepted.
pub fn parse_requested_start(raw: &str) -> Result<DateTime<FixedOffset>, Rejection> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|_| Rejection::AmbiguousTimestamp(raw.to_string()))
}

/// One proposed booking plus the snapshot it is judged against.
#[derive(Debug, Clone)]
pub struct BookingRequest<'a> {
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub clinic_id: Ulid,
    pub requested_start: DateTime<FixedOffset>,
    pub duration_minutes: i64,
    pub zone: Option<Tz>,
    /// Windows for other weekdays than the requested day are ignored.
    pub windows: &'a [AvailabilityWindow],
    pub booked: &'a [BookedInterval],
    pub now: DateTime<Utc>,
}

/// What the store needs to persist an accepted booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedBooking {
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub clinic_id: Ulid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Decide whether `req` may be booked. Pure: nothing is written.
///
/// Checks run in a fixed order and the first failure wins: duration,
/// not-in-the-past, timezone, containment in a window, then conflicts.
pub fn validate(req: &BookingRequest<'_>) -> Result<AcceptedBooking, Rejection> {
    let step = step_for(req.duration_minutes, Rejection::InvalidServiceDuration)?;

    let start = req.requested_start.with_timezone(&Utc);
    if start <= req.now {
        return Err(Rejection::PastBooking);
    }
    let end = start
        .checked_add_signed(step)
        .ok_or(Rejection::InvalidServiceDuration(req.duration_minutes))?;

    let zone = req.zone.ok_or(Rejection::MissingTimezone)?;
    let local = req.requested_start.with_timezone(&zone);
    let weekday = iso_weekday(local.weekday());
    let start_of_day = day_start(local.date_naive(), &zone);

    let resolved = req
        .windows
        .iter()
        .filter(|w| w.weekday == weekday)
        .map(|w| resolve(&start_of_day, w))
        .collect::<Result<Vec<_>, _>>()?;

    let inside = resolved.iter().any(|(window_start, window_end)| {
        start >= window_start.with_timezone(&Utc) && end <= window_end.with_timezone(&Utc)
    });
    if !inside {
        return Err(Rejection::OutsideAvailability);
    }

    if overlaps_any(start, end, req.booked) {
        return Err(Rejection::BookingConflict);
    }

    Ok(AcceptedBooking {
        provider_id: req.provider_id,
        service_id: req.service_id,
        clinic_id: req.clinic_id,
        start,
        end,
    })
}
