use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::time_of_day::parse_iso_weekday;
use super::{Rejection, TimeOfDay};

/// A weekly opening window: on `weekday` (ISO, 1 = Monday), from `start` to
/// `end` local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub weekday: u8,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl AvailabilityWindow {
    pub fn new(weekday: i64, start: TimeOfDay, end: TimeOfDay) -> Result<Self, Rejection> {
        let weekday = parse_iso_weekday(weekday)?;
        let window = Self { weekday, start, end };
        window.check_order()?;
        Ok(window)
    }

    /// Build from the raw `HH:MM` strings an availability record carries.
    pub fn parse(weekday: i64, start: &str, end: &str) -> Result<Self, Rejection> {
        Self::new(weekday, start.parse()?, end.parse()?)
    }

    fn check_order(&self) -> Result<(), Rejection> {
        if self.end <= self.start {
            return Err(Rejection::InvalidWindow {
                start: self.start.to_string(),
                end: self.end.to_string(),
            });
        }
        Ok(())
    }
}

fn resolve_local(zone: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    match zone.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => None,
    }
}

/// Resolve a local wall time, mapping a time skipped by a spring-forward gap
/// to the first instant after the gap.
fn resolve_wall_time(zone: &Tz, local: NaiveDateTime) -> DateTime<Tz> {
    if let Some(t) = resolve_local(zone, local) {
        return t;
    }
    (1..=24 * 60)
        .filter_map(|minute| local.checked_add_signed(Duration::minutes(minute)))
        .find_map(|later| resolve_local(zone, later))
        .unwrap_or_else(|| zone.from_utc_datetime(&local))
}

/// First instant of `date` in `zone`.
///
/// Normally local midnight. Where midnight falls inside a DST gap the day
/// begins at the first wall time after the gap.
pub fn day_start(date: NaiveDate, zone: &Tz) -> DateTime<Tz> {
    resolve_wall_time(zone, date.and_time(NaiveTime::MIN))
}

/// Resolve `window` to absolute instants on the calendar day that begins at
/// `day_start`, in `day_start`'s zone.
///
/// Wall times are resolved by the zone rules: an ambiguous time (fall-back)
/// takes the earlier instant, a skipped time (spring-forward) moves to the
/// first instant after the gap. Both ends follow the same rule, so a window
/// lying wholly inside a gap resolves to an empty range `(start, start)`.
pub fn resolve(
    day_start: &DateTime<Tz>,
    window: &AvailabilityWindow,
) -> Result<(DateTime<Tz>, DateTime<Tz>), Rejection> {
    window.check_order()?;

    let zone = day_start.timezone();
    let date = day_start.date_naive();
    let at = |tod: TimeOfDay| resolve_wall_time(&zone, date.and_time(tod.to_naive_time()));

    let window_start = at(window.start);
    let window_end = at(window.end).max(window_start);
    Ok((window_start, window_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Utc};
    use chrono_tz::{America, Asia, Europe};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn window(start: &str, end: &str) -> AvailabilityWindow {
        AvailabilityWindow::parse(1, start, end).unwrap()
    }

    #[test]
    fn day_start_is_local_midnight() {
        let ds = day_start(date(2026, 10, 19), &Asia::Kuala_Lumpur);
        assert_eq!(ds.hour(), 0);
        assert_eq!(ds.minute(), 0);
        // UTC+8 midnight is 16:00 the previous day in UTC.
        assert_eq!(ds.with_timezone(&Utc).hour(), 16);
    }

    #[test]
    fn resolve_plain_day() {
        let ds = day_start(date(2026, 10, 19), &Asia::Kuala_Lumpur);
        let (ws, we) = resolve(&ds, &window("09:00", "17:00")).unwrap();
        assert_eq!(ws, ds + Duration::minutes(9 * 60));
        assert_eq!(we, ds + Duration::minutes(17 * 60));
    }

    #[test]
    fn resolve_rejects_inverted_window() {
        let ds = day_start(date(2026, 10, 19), &Asia::Kuala_Lumpur);
        let w = AvailabilityWindow {
            weekday: 1,
            start: "17:00".parse().unwrap(),
            end: "09:00".parse().unwrap(),
        };
        assert!(matches!(resolve(&ds, &w), Err(Rejection::InvalidWindow { .. })));
    }

    #[test]
    fn resolve_rejects_empty_window() {
        let ds = day_start(date(2026, 10, 19), &Asia::Kuala_Lumpur);
        let w = AvailabilityWindow {
            weekday: 1,
            start: "09:00".parse().unwrap(),
            end: "09:00".parse().unwrap(),
        };
        assert!(matches!(resolve(&ds, &w), Err(Rejection::InvalidWindow { .. })));
    }

    #[test]
    fn constructor_validates() {
        assert!(matches!(
            AvailabilityWindow::parse(1, "10:00", "09:00"),
            Err(Rejection::InvalidWindow { .. })
        ));
        assert!(matches!(
            AvailabilityWindow::parse(1, "9:00", "10:00"),
            Err(Rejection::InvalidTimeOfDay(_))
        ));
        assert!(matches!(
            AvailabilityWindow::parse(0, "09:00", "10:00"),
            Err(Rejection::InvalidWeekday(0))
        ));
    }

    #[test]
    fn resolve_keeps_wall_clock_across_spring_forward() {
        // 2026-03-08: New York jumps from 02:00 to 03:00.
        let ds = day_start(date(2026, 3, 8), &America::New_York);
        let (ws, we) = resolve(&ds, &window("09:00", "17:00")).unwrap();
        assert_eq!(ws.hour(), 9);
        assert_eq!(we.hour(), 17);
        // Only 23 hours in the day, so 09:00 is 8 elapsed hours after midnight.
        assert_eq!(ws - ds, Duration::hours(8));
    }

    #[test]
    fn resolve_keeps_wall_clock_across_fall_back() {
        // 2026-10-25: Berlin repeats 02:00..03:00.
        let ds = day_start(date(2026, 10, 25), &Europe::Berlin);
        let (ws, _) = resolve(&ds, &window("09:00", "17:00")).unwrap();
        assert_eq!(ws.hour(), 9);
        assert_eq!(ws - ds, Duration::hours(10));
    }

    #[test]
    fn resolve_ambiguous_takes_earliest() {
        let ds = day_start(date(2026, 10, 25), &Europe::Berlin);
        let (ws, we) = resolve(&ds, &window("02:30", "04:00")).unwrap();
        // Earlier 02:30 is still summer time (UTC+2) => 00:30 UTC.
        assert_eq!(ws.with_timezone(&Utc).hour(), 0);
        assert_eq!(ws.with_timezone(&Utc).minute(), 30);
        assert!(we > ws);
    }

    #[test]
    fn resolve_skipped_time_moves_past_the_gap() {
        // 02:30 does not exist on 2026-03-08 in New York; 03:00 EDT is the
        // first instant after the gap, two elapsed hours after midnight EST.
        let ds = day_start(date(2026, 3, 8), &America::New_York);
        let (ws, we) = resolve(&ds, &window("02:30", "03:15")).unwrap();
        assert_eq!(ws, ds + Duration::minutes(120));
        assert_eq!((ws.hour(), ws.minute()), (3, 0));
        assert_eq!(we - ws, Duration::minutes(15));
    }

    #[test]
    fn window_inside_gap_resolves_empty() {
        let ds = day_start(date(2026, 3, 8), &America::New_York);
        let (ws, we) = resolve(&ds, &window("02:10", "02:50")).unwrap();
        assert_eq!(ws, we);
        assert_eq!((ws.hour(), ws.minute()), (3, 0));
    }
}
