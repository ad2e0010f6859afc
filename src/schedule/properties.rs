use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::{America, Asia, Europe, Tz};
use proptest::prelude::*;
use ulid::Ulid;

use super::*;

const ZONES: [Tz; 3] = [Asia::Kuala_Lumpur, Europe::Berlin, America::New_York];

#[derive(Debug, Clone)]
struct Scenario {
    date: NaiveDate,
    zone: Tz,
    duration: i64,
    windows: Vec<AvailabilityWindow>,
    booked: Vec<BookedInterval>,
    now: DateTime<Utc>,
}

impl Scenario {
    fn query(&self) -> SlotQuery<'_> {
        SlotQuery {
            date: self.date,
            zone: Some(self.zone),
            duration_minutes: self.duration,
            windows: &self.windows,
            booked: &self.booked,
            now: self.now,
        }
    }

    fn slots(&self) -> Result<Vec<DateTime<Tz>>, TestCaseError> {
        generate(&self.query()).map_err(|e| TestCaseError::fail(format!("generate failed: {e}")))
    }

    fn resolved(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let ds = day_start(self.date, &self.zone);
        self.windows
            .iter()
            .map(|w| {
                let (s, e) = resolve(&ds, w).unwrap();
                (s.with_timezone(&Utc), e.with_timezone(&Utc))
            })
            .collect()
    }
}

fn window_strategy() -> impl Strategy<Value = (u32, u32)> {
    (0u32..1380, 1u32..600).prop_map(|(start, len)| (start, (start + len).min(1439)))
}

fn scenario() -> impl Strategy<Value = Scenario> {
    (
        0i64..365,
        0usize..ZONES.len(),
        prop_oneof![Just(15i64), Just(20), Just(30), Just(45), Just(60), 1i64..180],
        prop::collection::vec(window_strategy(), 0..4),
        prop::collection::vec((0i64..1440, 1i64..180), 0..6),
        -1440i64..2880,
    )
        .prop_map(|(day, zone_idx, duration, raw_windows, raw_booked, now_offset)| {
            let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + Duration::days(day);
            let zone = ZONES[zone_idx];
            let weekday = date.weekday().number_from_monday() as i64;
            let windows = raw_windows
                .into_iter()
                .map(|(s, e)| {
                    let start = TimeOfDay::from_hm(s / 60, s % 60).unwrap();
                    let end = TimeOfDay::from_hm(e / 60, e % 60).unwrap();
                    AvailabilityWindow::new(weekday, start, end).unwrap()
                })
                .collect();
            let base = day_start(date, &zone).with_timezone(&Utc);
            let booked = raw_booked
                .into_iter()
                .map(|(off, len)| {
                    let start = base + Duration::minutes(off);
                    BookedInterval::new(start, start + Duration::minutes(len))
                })
                .collect();
            Scenario {
                date,
                zone,
                duration,
                windows,
                booked,
                now: base + Duration::minutes(now_offset),
            }
        })
}

proptest! {
    #[test]
    fn every_slot_fits_inside_some_window(sc in scenario()) {
        let slots = sc.slots()?;
        let windows = sc.resolved();
        let step = Duration::minutes(sc.duration);
        for t in slots {
            let t = t.with_timezone(&Utc);
            prop_assert!(windows.iter().any(|(ws, we)| t >= *ws && t + step <= *we));
        }
    }

    #[test]
    fn no_slot_touches_a_booking(sc in scenario()) {
        let step = Duration::minutes(sc.duration);
        for t in sc.slots()? {
            let t = t.with_timezone(&Utc);
            for b in &sc.booked {
                prop_assert!(!overlaps(t, t + step, b.start, b.end));
            }
        }
    }

    #[test]
    fn no_slot_at_or_before_now(sc in scenario()) {
        for t in sc.slots()? {
            prop_assert!(t.with_timezone(&Utc) > sc.now);
        }
    }

    #[test]
    fn slots_strictly_ascending(sc in scenario()) {
        let slots = sc.slots()?;
        for pair in slots.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn generation_is_idempotent(sc in scenario()) {
        prop_assert_eq!(generate(&sc.query()), generate(&sc.query()));
    }

    #[test]
    fn validator_accepts_every_generated_slot(sc in scenario()) {
        for t in sc.slots()? {
            let req = BookingRequest {
                provider_id: Ulid::nil(),
                service_id: Ulid::nil(),
                clinic_id: Ulid::nil(),
                requested_start: t.fixed_offset(),
                duration_minutes: sc.duration,
                zone: Some(sc.zone),
                windows: &sc.windows,
                booked: &sc.booked,
                now: sc.now,
            };
            let accepted = validate(&req);
            prop_assert!(accepted.is_ok(), "slot {} rejected: {:?}", t, accepted);
        }
    }
}
