use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::Rejection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    /// `scheduled` is the only state with outgoing edges.
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        matches!(
            (self, next),
            (AppointmentStatus::Scheduled, AppointmentStatus::Cancelled)
                | (AppointmentStatus::Scheduled, AppointmentStatus::Completed)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(AppointmentStatus::Scheduled),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Patient,
    Provider,
    Admin,
}

/// An authenticated caller. Providers and patients carry the id of the
/// record they act as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    Admin,
    Provider(Ulid),
    Patient(Ulid),
}

impl Actor {
    pub fn role(&self) -> Role {
        match self {
            Actor::Admin => Role::Admin,
            Actor::Provider(_) => Role::Provider,
            Actor::Patient(_) => Role::Patient,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Admin => f.write_str("admin"),
            Actor::Provider(id) => write!(f, "provider:{id}"),
            Actor::Patient(id) => write!(f, "patient:{id}"),
        }
    }
}

impl FromStr for Actor {
    type Err = Rejection;

    /// `admin`, `provider:<ulid>` or `patient:<ulid>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "admin" {
            return Ok(Actor::Admin);
        }
        let (role, id) = s.split_once(':').ok_or(Rejection::Unauthenticated)?;
        let id = Ulid::from_string(id).map_err(|_| Rejection::Unauthenticated)?;
        match role {
            "provider" => Ok(Actor::Provider(id)),
            "patient" => Ok(Actor::Patient(id)),
            _ => Err(Rejection::Unauthenticated),
        }
    }
}

/// The slice of a persisted appointment the cancellation guards look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppointmentView {
    pub patient_id: Ulid,
    pub start: DateTime<Utc>,
    pub status: AppointmentStatus,
}

fn authenticated(actor: Option<&Actor>) -> Result<&Actor, Rejection> {
    actor.ok_or(Rejection::Unauthenticated)
}

/// May `actor` move `appt` from `scheduled` to `cancelled` at `now`?
///
/// Identity checks come before state checks, so a stranger learns nothing
/// about someone else's appointment.
pub fn authorize_cancel(
    actor: Option<&Actor>,
    appt: &AppointmentView,
    now: DateTime<Utc>,
) -> Result<(), Rejection> {
    match authenticated(actor)? {
        Actor::Patient(id) if *id != appt.patient_id => return Err(Rejection::Forbidden),
        _ => {}
    }
    if appt.start <= now {
        return Err(Rejection::NotCancellable);
    }
    if !appt.status.can_transition_to(AppointmentStatus::Cancelled) {
        return Err(Rejection::NotCancellable);
    }
    Ok(())
}

/// Patients book for themselves; providers and admins for anyone.
pub fn authorize_booking(actor: Option<&Actor>, patient_id: Ulid) -> Result<(), Rejection> {
    match authenticated(actor)? {
        Actor::Patient(id) if *id != patient_id => Err(Rejection::Forbidden),
        _ => Ok(()),
    }
}

pub fn authorize_provider_schedule(actor: Option<&Actor>, provider_id: Ulid) -> Result<(), Rejection> {
    match authenticated(actor)? {
        Actor::Admin => Ok(()),
        Actor::Provider(id) if *id == provider_id => Ok(()),
        _ => Err(Rejection::Forbidden),
    }
}

pub fn authorize_admin(actor: Option<&Actor>) -> Result<(), Rejection> {
    match authenticated(actor)? {
        Actor::Admin => Ok(()),
        _ => Err(Rejection::Forbidden),
    }
}

/// Returns the patient whose appointments the caller may list.
pub fn authorize_own_appointments(actor: Option<&Actor>) -> Result<Ulid, Rejection> {
    match authenticated(actor)? {
        Actor::Patient(id) => Ok(*id),
        _ => Err(Rejection::Forbidden),
    }
}

/// Windows are edited by an admin or by the provider they belong to.
pub fn authorize_availability_edit(actor: Option<&Actor>, provider_id: Ulid) -> Result<(), Rejection> {
    authorize_provider_schedule(actor, provider_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 1, 0, 0).unwrap()
    }

    fn view(patient_id: Ulid, status: AppointmentStatus) -> AppointmentView {
        AppointmentView {
            patient_id,
            start: now() + Duration::hours(2),
            status,
        }
    }

    #[test]
    fn cancelling_twice_is_not_cancellable() {
        let patient = Ulid::new();
        let actor = Actor::Patient(patient);
        let appt = view(patient, AppointmentStatus::Cancelled);
        assert_eq!(
            authorize_cancel(Some(&actor), &appt, now()),
            Err(Rejection::NotCancellable)
        );
    }

    #[test]
    fn owner_can_cancel_future_scheduled() {
        let patient = Ulid::new();
        let appt = view(patient, AppointmentStatus::Scheduled);
        assert!(authorize_cancel(Some(&Actor::Patient(patient)), &appt, now()).is_ok());
    }

    #[test]
    fn other_patient_is_forbidden_even_when_not_cancellable() {
        let appt = view(Ulid::new(), AppointmentStatus::Completed);
        assert_eq!(
            authorize_cancel(Some(&Actor::Patient(Ulid::new())), &appt, now()),
            Err(Rejection::Forbidden)
        );
    }

    #[test]
    fn anonymous_is_unauthenticated() {
        let appt = view(Ulid::new(), AppointmentStatus::Scheduled);
        assert_eq!(authorize_cancel(None, &appt, now()), Err(Rejection::Unauthenticated));
    }

    #[test]
    fn staff_can_cancel_any() {
        let appt = view(Ulid::new(), AppointmentStatus::Scheduled);
        assert!(authorize_cancel(Some(&Actor::Admin), &appt, now()).is_ok());
        assert!(authorize_cancel(Some(&Actor::Provider(Ulid::new())), &appt, now()).is_ok());
    }

    #[test]
    fn started_appointment_is_not_cancellable() {
        let patient = Ulid::new();
        let mut appt = view(patient, AppointmentStatus::Scheduled);
        appt.start = now();
        assert_eq!(
            authorize_cancel(Some(&Actor::Patient(patient)), &appt, now()),
            Err(Rejection::NotCancellable)
        );
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use AppointmentStatus::*;
        for from in [Completed, Cancelled] {
            for to in [Scheduled, Completed, Cancelled] {
                assert!(!from.can_transition_to(to));
            }
        }
        assert!(Scheduled.can_transition_to(Cancelled));
        assert!(Scheduled.can_transition_to(Completed));
        assert!(!Scheduled.can_transition_to(Scheduled));
    }

    #[test]
    fn status_round_trips_text() {
        for s in ["scheduled", "completed", "cancelled"] {
            assert_eq!(s.parse::<AppointmentStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<AppointmentStatus>().is_err());
    }

    #[test]
    fn actor_parses_login_names() {
        let id = Ulid::new();
        assert_eq!("admin".parse::<Actor>().unwrap(), Actor::Admin);
        assert_eq!(format!("provider:{id}").parse::<Actor>().unwrap(), Actor::Provider(id));
        assert_eq!(format!("patient:{id}").parse::<Actor>().unwrap(), Actor::Patient(id));
        for bad in ["", "postgres", "patient:", "patient:nope", "nurse:01ARZ3NDEKTSV4RRFFQ69G5FAV"] {
            assert!(bad.parse::<Actor>().is_err(), "{bad:?}");
        }
        assert_eq!(Actor::Patient(id).to_string().parse::<Actor>().unwrap(), Actor::Patient(id));
    }

    #[test]
    fn booking_guard() {
        let me = Ulid::new();
        assert!(authorize_booking(Some(&Actor::Patient(me)), me).is_ok());
        assert_eq!(
            authorize_booking(Some(&Actor::Patient(me)), Ulid::new()),
            Err(Rejection::Forbidden)
        );
        assert!(authorize_booking(Some(&Actor::Provider(Ulid::new())), me).is_ok());
        assert!(authorize_booking(Some(&Actor::Admin), me).is_ok());
        assert_eq!(authorize_booking(None, me), Err(Rejection::Unauthenticated));
    }

    #[test]
    fn schedule_guard() {
        let doc = Ulid::new();
        assert!(authorize_provider_schedule(Some(&Actor::Admin), doc).is_ok());
        assert!(authorize_provider_schedule(Some(&Actor::Provider(doc)), doc).is_ok());
        assert_eq!(
            authorize_provider_schedule(Some(&Actor::Provider(Ulid::new())), doc),
            Err(Rejection::Forbidden)
        );
        assert_eq!(
            authorize_provider_schedule(Some(&Actor::Patient(Ulid::new())), doc),
            Err(Rejection::Forbidden)
        );
    }

    #[test]
    fn admin_and_own_listing_guards() {
        let me = Ulid::new();
        assert!(authorize_admin(Some(&Actor::Admin)).is_ok());
        assert_eq!(authorize_admin(Some(&Actor::Patient(me))), Err(Rejection::Forbidden));
        assert_eq!(authorize_own_appointments(Some(&Actor::Patient(me))), Ok(me));
        assert_eq!(authorize_own_appointments(Some(&Actor::Admin)), Err(Rejection::Forbidden));
        assert_eq!(authorize_own_appointments(None), Err(Rejection::Unauthenticated));
    }
}
