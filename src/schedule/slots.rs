use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

use super::overlap::{overlaps_any, BookedInterval};
use super::time_of_day::iso_weekday;
use super::window::{day_start, resolve, AvailabilityWindow};
use super::Rejection;

/// Inputs for one slot listing. Everything is a caller-owned snapshot.
#[derive(Debug, Clone)]
pub struct SlotQuery<'a> {
    pub date: NaiveDate,
    pub zone: Option<Tz>,
    pub duration_minutes: i64,
    /// Windows for other weekdays than `date`'s are ignored.
    pub windows: &'a [AvailabilityWindow],
    pub booked: &'a [BookedInterval],
    pub now: DateTime<Utc>,
}

pub(crate) fn step_for(duration_minutes: i64, err: fn(i64) -> Rejection) -> Result<Duration, Rejection> {
    if duration_minutes <= 0 {
        return Err(err(duration_minutes));
    }
    Duration::try_minutes(duration_minutes).ok_or(err(duration_minutes))
}

/// Bookable start instants on `query.date`, ascending and unique.
///
/// A candidate is kept when `[t, t + duration)` fits entirely inside one
/// window, `t` is strictly after `now`, and it overlaps no booked interval.
/// An empty result is not an error.
pub fn generate(query: &SlotQuery<'_>) -> Result<Vec<DateTime<Tz>>, Rejection> {
    let step = step_for(query.duration_minutes, Rejection::InvalidDuration)?;
    let zone = query.zone.ok_or(Rejection::MissingTimezone)?;

    let now = query.now.with_timezone(&zone);
    let start_of_day = day_start(query.date, &zone);
    let weekday = iso_weekday(query.date.weekday());

    let resolved = query
        .windows
        .iter()
        .filter(|w| w.weekday == weekday)
        .map(|w| resolve(&start_of_day, w))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    for (window_start, window_end) in resolved {
        let mut t = window_start;
        while let Some(end) = t.checked_add_signed(step).filter(|end| *end <= window_end) {
            let past = t <= now;
            if !past && !overlaps_any(t.with_timezone(&Utc), end.with_timezone(&Utc), query.booked) {
                out.push(t);
            }
            t = end;
        }
    }

    out.sort();
    out.dedup();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use chrono_tz::{America, Asia, Europe};

    const KL: Tz = Asia::Kuala_Lumpur;

    // 2026-10-19 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Tz> {
        KL.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        at(h, m).with_timezone(&Utc)
    }

    fn mon(start: &str, end: &str) -> AvailabilityWindow {
        AvailabilityWindow::parse(1, start, end).unwrap()
    }

    fn day_before() -> DateTime<Utc> {
        KL.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap().with_timezone(&Utc)
    }

    fn hm(slots: &[DateTime<Tz>]) -> Vec<String> {
        slots.iter().map(|t| t.format("%H:%M").to_string()).collect()
    }

    fn run(windows: &[AvailabilityWindow], booked: &[BookedInterval], now: DateTime<Utc>) -> Vec<DateTime<Tz>> {
        generate(&SlotQuery {
            date: monday(),
            zone: Some(KL),
            duration_minutes: 30,
            windows,
            booked,
            now,
        })
        .unwrap()
    }

    #[test]
    fn fills_window_without_partial_tail() {
        let slots = run(&[mon("09:00", "11:00")], &[], day_before());
        assert_eq!(hm(&slots), ["09:00", "09:30", "10:00", "10:30"]);
    }

    #[test]
    fn skips_booked_interval() {
        let booked = [BookedInterval::new(utc(9, 30), utc(10, 0))];
        let slots = run(&[mon("09:00", "11:00")], &booked, day_before());
        assert_eq!(hm(&slots), ["09:00", "10:00", "10:30"]);
    }

    #[test]
    fn hides_past_slots_today() {
        let slots = run(&[mon("09:00", "11:00")], &[], utc(9, 45));
        assert_eq!(hm(&slots), ["10:00", "10:30"]);
    }

    #[test]
    fn now_itself_is_excluded() {
        let slots = run(&[mon("09:00", "11:00")], &[], utc(10, 0));
        assert_eq!(hm(&slots), ["10:30"]);
    }

    #[test]
    fn overlapping_windows_are_deduplicated() {
        let slots = run(&[mon("09:00", "10:00"), mon("09:30", "10:30")], &[], day_before());
        assert_eq!(hm(&slots), ["09:00", "09:30", "10:00"]);
    }

    #[test]
    fn windows_are_sorted_regardless_of_input_order() {
        let slots = run(&[mon("14:00", "15:00"), mon("09:00", "10:00")], &[], day_before());
        assert_eq!(hm(&slots), ["09:00", "09:30", "14:00", "14:30"]);
    }

    #[test]
    fn other_weekdays_ignored() {
        let tuesday = AvailabilityWindow::parse(2, "09:00", "11:00").unwrap();
        let slots = run(&[tuesday], &[], day_before());
        assert!(slots.is_empty());
    }

    #[test]
    fn no_windows_is_empty_not_error() {
        assert!(run(&[], &[], day_before()).is_empty());
    }

    #[test]
    fn window_shorter_than_duration_is_empty() {
        assert!(run(&[mon("09:00", "09:20")], &[], day_before()).is_empty());
    }

    #[test]
    fn booking_partially_covering_slot_blocks_it() {
        let booked = [BookedInterval::new(utc(9, 50), utc(10, 10))];
        let slots = run(&[mon("09:00", "11:00")], &booked, day_before());
        assert_eq!(hm(&slots), ["09:00", "10:30"]);
    }

    // Every candidate on a past date is at or before now, so the list is empty
    // rather than an error, matching the validator's PastBooking.
    #[test]
    fn past_date_yields_nothing() {
        let tomorrow = KL.with_ymd_and_hms(2026, 10, 20, 8, 0, 0).unwrap().with_timezone(&Utc);
        assert!(run(&[mon("09:00", "11:00")], &[], tomorrow).is_empty());
    }

    #[test]
    fn rejects_non_positive_duration() {
        for d in [0, -30] {
            let result = generate(&SlotQuery {
                date: monday(),
                zone: Some(KL),
                duration_minutes: d,
                windows: &[mon("09:00", "11:00")],
                booked: &[],
                now: day_before(),
            });
            assert_eq!(result, Err(Rejection::InvalidDuration(d)));
        }
    }

    #[test]
    fn rejects_missing_zone() {
        let result = generate(&SlotQuery {
            date: monday(),
            zone: None,
            duration_minutes: 30,
            windows: &[mon("09:00", "11:00")],
            booked: &[],
            now: day_before(),
        });
        assert_eq!(result, Err(Rejection::MissingTimezone));
    }

    #[test]
    fn malformed_window_fails_hard() {
        let broken = AvailabilityWindow {
            weekday: 1,
            start: "11:00".parse().unwrap(),
            end: "09:00".parse().unwrap(),
        };
        let result = generate(&SlotQuery {
            date: monday(),
            zone: Some(KL),
            duration_minutes: 30,
            windows: &[mon("13:00", "14:00"), broken],
            booked: &[],
            now: day_before(),
        });
        assert!(matches!(result, Err(Rejection::InvalidWindow { .. })));
    }

    #[test]
    fn elapsed_time_steps_through_fall_back() {
        // Sunday 2026-10-25, Berlin repeats 02:00..03:00: 01:00..04:00 is 4 real hours.
        let berlin = Europe::Berlin;
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 25).unwrap();
        let window = AvailabilityWindow::parse(7, "01:00", "04:00").unwrap();
        let slots = generate(&SlotQuery {
            date: sunday,
            zone: Some(berlin),
            duration_minutes: 60,
            windows: &[window],
            booked: &[],
            now: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap(),
        })
        .unwrap();
        assert_eq!(slots.len(), 4);
        let hours: Vec<u32> = slots.iter().map(|t| t.hour()).collect();
        assert_eq!(hours, [1, 2, 2, 3]);
    }

    #[test]
    fn window_in_spring_forward_gap_leaves_other_windows_intact() {
        // Sunday 2026-03-08, New York skips 02:00..03:00.
        let new_york = America::New_York;
        let sunday = NaiveDate::from_ymd_opt(2026, 3, 8).unwrap();
        let slots = generate(&SlotQuery {
            date: sunday,
            zone: Some(new_york),
            duration_minutes: 30,
            windows: &[
                AvailabilityWindow::parse(7, "09:00", "10:00").unwrap(),
                AvailabilityWindow::parse(7, "02:30", "03:15").unwrap(),
                AvailabilityWindow::parse(7, "02:10", "02:50").unwrap(),
            ],
            booked: &[],
            now: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        })
        .unwrap();
        // 02:30-03:15 shrinks to 03:00-03:15, too short for 30 minutes.
        assert_eq!(hm(&slots), ["09:00", "09:30"]);
    }

    #[test]
    fn day_at_end_of_calendar_does_not_overflow() {
        // In Los Angeles the last calendar day ends after the last representable UTC instant.
        let last = NaiveDate::MAX;
        let result = generate(&SlotQuery {
            date: last,
            zone: Some(America::Los_Angeles),
            duration_minutes: 1440,
            windows: &[AvailabilityWindow::parse(iso_weekday(last.weekday()).into(), "00:00", "23:59").unwrap()],
            booked: &[],
            now: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        });
        assert_eq!(result, Ok(vec![]));
    }

    #[test]
    fn identical_inputs_identical_output() {
        let booked = [BookedInterval::new(utc(9, 30), utc(10, 0))];
        let windows = [mon("09:00", "11:00"), mon("10:00", "12:00")];
        let a = run(&windows, &booked, utc(8, 0));
        let b = run(&windows, &booked, utc(8, 0));
        assert_eq!(a, b);
    }
}
