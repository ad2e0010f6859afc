use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::schedule::{overlaps, AppointmentStatus, AvailabilityWindow, BookedInterval, TimeOfDay};

/// Unix milliseconds, the storage time type. Converted to chrono at the edges.
pub type Ms = i64;

pub fn to_ms(t: DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

pub fn from_ms(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_utc(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(to_ms(start), to_ms(end))
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        from_ms(self.start)
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        from_ms(self.end)
    }
}

// ── Catalog ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clinic {
    pub id: Ulid,
    pub name: String,
    /// `None` when the clinic was registered without a zone; every
    /// time-based operation on it then fails with `MissingTimezone`.
    pub zone: Option<Tz>,
    pub address: Option<String>,
}

impl Clinic {
    pub fn timezone_name(&self) -> Option<&'static str> {
        self.zone.map(|z| z.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub id: Ulid,
    pub clinic_id: Ulid,
    pub name: String,
    pub speciality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patient {
    pub id: Ulid,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: Ulid,
    pub clinic_id: Ulid,
    pub name: String,
    pub duration_min: i64,
}

// ── Per-provider state ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityRecord {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub window: AvailabilityWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: Ulid,
    pub clinic_id: Ulid,
    pub provider_id: Ulid,
    pub patient_id: Ulid,
    pub service_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
}

/// Everything that can change under one provider's lock: its windows and
/// its appointments.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub provider: Provider,
    pub windows: Vec<AvailabilityRecord>,
    /// Sorted by `span.start`; cancelled and completed rows are kept.
    pub appointments: Vec<Appointment>,
}

impl ProviderState {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            windows: Vec::new(),
            appointments: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.provider.id
    }

    pub fn add_window(&mut self, record: AvailabilityRecord) {
        self.windows.push(record);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityRecord> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    /// Weekly windows as the scheduling core consumes them.
    pub fn weekly_windows(&self) -> Vec<AvailabilityWindow> {
        self.windows.iter().map(|w| w.window).collect()
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appt: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appt.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appt);
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments of any status whose span overlaps `query`.
    /// Uses binary search to skip everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Scheduled appointments overlapping `query`, as the read-only snapshot
    /// the slot generator and booking validator take.
    pub fn booked_in(&self, query: &Span) -> Vec<BookedInterval> {
        self.overlapping(query)
            .filter(|a| a.status == AppointmentStatus::Scheduled)
            .map(|a| BookedInterval::new(a.span.start_utc(), a.span.end_utc()))
            .collect()
    }

    pub fn scheduled_count(&self) -> usize {
        self.appointments
            .iter()
            .filter(|a| a.status == AppointmentStatus::Scheduled)
            .count()
    }
}

/// The event types, flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClinicCreated {
        id: Ulid,
        name: String,
        timezone: Option<String>,
        address: Option<String>,
    },
    ProviderCreated {
        id: Ulid,
        clinic_id: Ulid,
        name: String,
        speciality: Option<String>,
    },
    PatientCreated {
        id: Ulid,
        name: String,
        phone: Option<String>,
    },
    ServiceCreated {
        id: Ulid,
        clinic_id: Ulid,
        name: String,
        duration_min: i64,
    },
    AvailabilityAdded {
        id: Ulid,
        provider_id: Ulid,
        weekday: u8,
        start: TimeOfDay,
        end: TimeOfDay,
    },
    AvailabilityRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        clinic_id: Ulid,
        provider_id: Ulid,
        patient_id: Ulid,
        service_id: Ulid,
        span: Span,
        notes: Option<String>,
    },
    AppointmentCancelled {
        id: Ulid,
        provider_id: Ulid,
    },
    AppointmentCompleted {
        id: Ulid,
        provider_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityInfo {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub weekday: u8,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl From<&AvailabilityRecord> for AvailabilityInfo {
    fn from(r: &AvailabilityRecord) -> Self {
        Self {
            id: r.id,
            provider_id: r.provider_id,
            weekday: r.window.weekday,
            start: r.window.start,
            end: r.window.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub clinic_id: Ulid,
    pub provider_id: Ulid,
    pub patient_id: Ulid,
    pub service_id: Ulid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
}

impl From<&Appointment> for AppointmentInfo {
    fn from(a: &Appointment) -> Self {
        Self {
            id: a.id,
            clinic_id: a.clinic_id,
            provider_id: a.provider_id,
            patient_id: a.patient_id,
            service_id: a.service_id,
            start: a.span.start_utc(),
            end: a.span.end_utc(),
            status: a.status,
            notes: a.notes.clone(),
        }
    }
}

/// One bookable start, in the clinic's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderState {
        ProviderState::new(Provider {
            id: Ulid::new(),
            clinic_id: Ulid::new(),
            name: "Dr Tan".into(),
            speciality: None,
        })
    }

    fn appt(start: Ms, end: Ms, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            clinic_id: Ulid::nil(),
            provider_id: Ulid::nil(),
            patient_id: Ulid::nil(),
            service_id: Ulid::nil(),
            span: Span::new(start, end),
            status,
            notes: None,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn ms_conversion_round_trips() {
        let t = DateTime::from_timestamp_millis(1_792_000_000_123).unwrap();
        assert_eq!(from_ms(to_ms(t)), t);
        let span = Span::from_utc(t, t + chrono::Duration::minutes(30));
        assert_eq!(span.end - span.start, 30 * 60_000);
        assert_eq!(span.start_utc(), t);
    }

    #[test]
    fn appointments_stay_sorted() {
        let mut ps = provider();
        ps.insert_appointment(appt(300, 400, AppointmentStatus::Scheduled));
        ps.insert_appointment(appt(100, 200, AppointmentStatus::Scheduled));
        ps.insert_appointment(appt(200, 300, AppointmentStatus::Cancelled));
        let starts: Vec<Ms> = ps.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, [100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ps = provider();
        ps.insert_appointment(appt(100, 200, AppointmentStatus::Scheduled));
        ps.insert_appointment(appt(450, 600, AppointmentStatus::Scheduled));
        ps.insert_appointment(appt(1000, 1100, AppointmentStatus::Scheduled));
        let hits: Vec<_> = ps.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ps = provider();
        ps.insert_appointment(appt(100, 200, AppointmentStatus::Scheduled));
        assert_eq!(ps.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn booked_in_ignores_cancelled_and_completed() {
        let mut ps = provider();
        ps.insert_appointment(appt(100, 200, AppointmentStatus::Cancelled));
        ps.insert_appointment(appt(150, 250, AppointmentStatus::Completed));
        ps.insert_appointment(appt(180, 220, AppointmentStatus::Scheduled));
        let booked = ps.booked_in(&Span::new(0, 1000));
        assert_eq!(booked.len(), 1);
        assert_eq!(booked[0].start, from_ms(180));
        assert_eq!(ps.scheduled_count(), 1);
    }

    #[test]
    fn windows_add_and_remove() {
        let mut ps = provider();
        let id = Ulid::new();
        let window = AvailabilityWindow::parse(1, "09:00", "12:00").unwrap();
        ps.add_window(AvailabilityRecord { id, provider_id: ps.id(), window });
        assert_eq!(ps.weekly_windows(), vec![window]);
        assert!(ps.remove_window(Ulid::new()).is_none());
        assert_eq!(ps.remove_window(id).map(|r| r.window), Some(window));
        assert!(ps.windows.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AvailabilityAdded {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            weekday: 3,
            start: "08:30".parse().unwrap(),
            end: "12:00".parse().unwrap(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
