use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::schedule::{
    self, authorize_provider_schedule, day_start, Actor, AppointmentStatus, Rejection, SlotQuery,
};

use super::conflict::now;
use super::{Engine, EngineError};

/// `[start of date, start of next date)` in `zone`, as storage milliseconds.
fn day_span(date: NaiveDate, zone: &Tz) -> Result<Span, EngineError> {
    let next = date
        .succ_opt()
        .ok_or(EngineError::InvalidInput("date out of range"))?;
    let start = day_start(date, zone).with_timezone(&Utc);
    let end = day_start(next, zone).with_timezone(&Utc);
    Ok(Span::from_utc(start, end))
}

fn sorted_by_id<T>(mut rows: Vec<T>, id: impl Fn(&T) -> Ulid) -> Vec<T> {
    rows.sort_by_key(|r| id(r));
    rows
}

impl Engine {
    /// Bookable starts for one provider, service and calendar date in the
    /// clinic's zone. Nothing free is an empty list, not an error.
    pub async fn list_slots(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        self.list_slots_at(provider_id, service_id, date, now()).await
    }

    pub(super) async fn list_slots_at(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        let service = self
            .service(&service_id)
            .ok_or(EngineError::not_found("service", service_id))?;
        let ps = self.provider_or_not_found(provider_id)?;
        let guard = ps.read().await;
        let zone = self.provider_zone(&guard.provider)?;

        // Without a zone there is no day to look at; let the generator say so.
        let booked = match &zone {
            Some(z) => guard.booked_in(&day_span(date, z)?),
            None => Vec::new(),
        };
        let windows = guard.weekly_windows();
        let starts = schedule::generate(&SlotQuery {
            date,
            zone,
            duration_minutes: service.duration_min,
            windows: &windows,
            booked: &booked,
            now,
        })?;
        drop(guard);

        let step = Duration::minutes(service.duration_min);
        Ok(starts
            .into_iter()
            .map(|start| SlotInfo { start, end: start + step })
            .collect())
    }

    pub fn list_clinics(&self) -> Vec<Clinic> {
        let rows: Vec<Clinic> = self.clinics.iter().map(|e| e.value().clone()).collect();
        sorted_by_id(rows, |c| c.id)
    }

    pub fn list_services(&self, clinic_id: Option<Ulid>) -> Vec<Service> {
        let rows: Vec<Service> = self
            .services
            .iter()
            .filter(|e| clinic_id.is_none_or(|c| e.value().clinic_id == c))
            .map(|e| e.value().clone())
            .collect();
        sorted_by_id(rows, |s| s.id)
    }

    pub async fn list_providers(&self, clinic_id: Option<Ulid>) -> Vec<Provider> {
        let shared: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::with_capacity(shared.len());
        for ps in shared {
            let guard = ps.read().await;
            if clinic_id.is_none_or(|c| guard.provider.clinic_id == c) {
                rows.push(guard.provider.clone());
            }
        }
        sorted_by_id(rows, |p| p.id)
    }

    pub async fn list_availability(&self, provider_id: Ulid) -> Result<Vec<AvailabilityInfo>, EngineError> {
        let ps = self.provider_or_not_found(provider_id)?;
        let guard = ps.read().await;
        let mut rows: Vec<AvailabilityInfo> = guard.windows.iter().map(AvailabilityInfo::from).collect();
        rows.sort_by_key(|w| (w.weekday, w.start, w.end));
        Ok(rows)
    }

    /// One provider's appointments (any status) starting on `date` in the
    /// clinic's zone, earliest first.
    pub async fn provider_schedule(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        actor: Option<&Actor>,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        authorize_provider_schedule(actor, provider_id)?;
        let ps = self.provider_or_not_found(provider_id)?;
        let guard = ps.read().await;
        let zone = self
            .provider_zone(&guard.provider)?
            .ok_or(Rejection::MissingTimezone)?;
        let day = day_span(date, &zone)?;
        Ok(guard
            .appointments
            .iter()
            .filter(|a| a.span.start >= day.start && a.span.start < day.end)
            .take(MAX_LISTED_APPOINTMENTS)
            .map(AppointmentInfo::from)
            .collect())
    }

    /// Every appointment starting on `date`, each judged in its own clinic's
    /// zone. Admin only.
    pub async fn appointments_on(
        &self,
        date: NaiveDate,
        actor: Option<&Actor>,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        schedule::authorize_admin(actor)?;
        let shared: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::new();
        for ps in shared {
            let guard = ps.read().await;
            let Some(zone) = self.provider_zone(&guard.provider)? else {
                continue;
            };
            let day = day_span(date, &zone)?;
            rows.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.span.start >= day.start && a.span.start < day.end)
                    .map(AppointmentInfo::from),
            );
        }
        rows.sort_by_key(|a| (a.start, a.id));
        rows.truncate(MAX_LISTED_APPOINTMENTS);
        Ok(rows)
    }

    /// A patient's scheduled appointments that have not started yet.
    pub async fn upcoming_for_patient(&self, patient_id: Ulid) -> Result<Vec<AppointmentInfo>, EngineError> {
        self.upcoming_for_patient_at(patient_id, now()).await
    }

    pub(super) async fn upcoming_for_patient_at(
        &self,
        patient_id: Ulid,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        if !self.patients.contains_key(&patient_id) {
            return Err(EngineError::not_found("patient", patient_id));
        }
        let now_ms = to_ms(now);
        let shared: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::new();
        for ps in shared {
            let guard = ps.read().await;
            rows.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| {
                        a.patient_id == patient_id
                            && a.status == AppointmentStatus::Scheduled
                            && a.span.start > now_ms
                    })
                    .map(AppointmentInfo::from),
            );
        }
        rows.sort_by_key(|a| (a.start, a.id));
        rows.truncate(MAX_LISTED_APPOINTMENTS);
        Ok(rows)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<AppointmentInfo, EngineError> {
        let provider_id = self
            .get_provider_for_entity(&id)
            .ok_or(EngineError::not_found("appointment", id))?;
        let ps = self.provider_or_not_found(provider_id)?;
        let guard = ps.read().await;
        guard
            .appointment(id)
            .map(AppointmentInfo::from)
            .ok_or(EngineError::not_found("appointment", id))
    }
}
