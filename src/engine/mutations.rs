use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::schedule::{
    self, authorize_cancel, Actor, AppointmentStatus, AppointmentView, AvailabilityWindow,
    BookingRequest, Rejection,
};

use super::conflict::{check_exclusion, now, validate_span};
use super::{Engine, EngineError, WalCommand};

/// A booking as submitted: the requested start still carries the caller's
/// offset, the end is derived from the service.
#[derive(Debug, Clone)]
pub struct BookAppointment {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub patient_id: Ulid,
    pub service_id: Ulid,
    pub requested_start: DateTime<FixedOffset>,
    pub notes: Option<String>,
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput(what));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_text(text: &Option<String>) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > MAX_TEXT_LEN => Err(EngineError::LimitExceeded("text field too long")),
        _ => Ok(()),
    }
}

fn outcome_label(result: &Result<impl Sized, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::Rejected(r)) => r.reason_code(),
        Err(EngineError::NotFound { .. }) => "not_found",
        Err(_) => "error",
    }
}

impl Engine {
    pub async fn create_clinic(
        &self,
        id: Ulid,
        name: String,
        timezone: Option<String>,
        address: Option<String>,
    ) -> Result<(), EngineError> {
        if self.clinics.len() >= MAX_CLINICS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many clinics"));
        }
        check_name(&name, "clinic name is required")?;
        check_text(&address)?;
        let zone = match timezone.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(tz) => Some(
                tz.parse::<Tz>()
                    .map_err(|_| EngineError::InvalidTimezone(tz.to_string()))?,
            ),
        };
        if self.clinics.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ClinicCreated {
            id,
            name,
            timezone: zone.map(|z| z.name().to_string()),
            address,
        };
        self.persist_catalog(&event).await
    }

    pub async fn create_provider(
        &self,
        id: Ulid,
        clinic_id: Ulid,
        name: String,
        speciality: Option<String>,
    ) -> Result<(), EngineError> {
        if self.providers.len() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        check_name(&name, "provider name is required")?;
        check_text(&speciality)?;
        if !self.clinics.contains_key(&clinic_id) {
            return Err(EngineError::not_found("clinic", clinic_id));
        }
        if self.providers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProviderCreated { id, clinic_id, name, speciality };
        self.persist_catalog(&event).await
    }

    pub async fn create_patient(
        &self,
        id: Ulid,
        name: String,
        phone: Option<String>,
    ) -> Result<(), EngineError> {
        if self.patients.len() >= MAX_PATIENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many patients"));
        }
        check_name(&name, "patient name is required")?;
        check_text(&phone)?;
        if self.patients.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::PatientCreated { id, name, phone };
        self.persist_catalog(&event).await
    }

    pub async fn create_service(
        &self,
        id: Ulid,
        clinic_id: Ulid,
        name: String,
        duration_min: i64,
    ) -> Result<(), EngineError> {
        if self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        check_name(&name, "service name is required")?;
        if duration_min <= 0 {
            return Err(Rejection::InvalidServiceDuration(duration_min).into());
        }
        if duration_min > MAX_SERVICE_DURATION_MIN {
            return Err(EngineError::LimitExceeded("service longer than a day"));
        }
        if !self.clinics.contains_key(&clinic_id) {
            return Err(EngineError::not_found("clinic", clinic_id));
        }
        if self.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceCreated { id, clinic_id, name, duration_min };
        self.persist_catalog(&event).await
    }

    /// Add a weekly window. Malformed `HH:MM`, an out-of-range weekday or an
    /// end not after start are refused here, before anything is stored.
    pub async fn add_availability(
        &self,
        id: Ulid,
        provider_id: Ulid,
        weekday: i64,
        start: &str,
        end: &str,
    ) -> Result<(), EngineError> {
        let window = AvailabilityWindow::parse(weekday, start, end)?;
        let ps = self.provider_or_not_found(provider_id)?;
        let _gate = self.compaction.read().await;
        let mut guard = ps.write().await;
        if guard.windows.len() >= MAX_WINDOWS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        if self.entity_to_provider.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::AvailabilityAdded {
            id,
            provider_id,
            weekday: window.weekday,
            start: window.start,
            end: window.end,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Returns the provider the window belonged to.
    pub async fn remove_availability(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.compaction.read().await;
        let mut guard = self.resolve_entity_write("availability", &id).await?;
        if !guard.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::not_found("availability", id));
        }
        let provider_id = guard.id();
        let event = Event::AvailabilityRemoved { id, provider_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(provider_id)
    }

    /// Validate and persist one booking.
    ///
    /// The validator runs against a snapshot taken under the provider's read
    /// lock. The write lock is then taken and the exclusion constraint is
    /// checked again against live state right before the WAL append, so two
    /// racing requests for the same slot cannot both land.
    pub async fn book_appointment(&self, req: BookAppointment) -> Result<AppointmentInfo, EngineError> {
        let result = self.book_appointment_inner(req).await;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        result
    }

    async fn book_appointment_inner(&self, req: BookAppointment) -> Result<AppointmentInfo, EngineError> {
        if let Some(n) = &req.notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if self.entity_to_provider.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let service = self
            .service(&req.service_id)
            .ok_or(EngineError::not_found("service", req.service_id))?;
        let ps = self.provider_or_not_found(req.provider_id)?;
        if !self.patients.contains_key(&req.patient_id) {
            return Err(EngineError::not_found("patient", req.patient_id));
        }

        let start_ms = req.requested_start.timestamp_millis();
        let horizon = Span::new(start_ms, start_ms + MAX_SERVICE_DURATION_MIN * 60_000);

        let accepted = {
            let guard = ps.read().await;
            let zone = self.provider_zone(&guard.provider)?;
            let windows = guard.weekly_windows();
            let booked = guard.booked_in(&horizon);
            schedule::validate(&BookingRequest {
                provider_id: req.provider_id,
                service_id: req.service_id,
                clinic_id: guard.provider.clinic_id,
                requested_start: req.requested_start,
                duration_minutes: service.duration_min,
                zone,
                windows: &windows,
                booked: &booked,
                now: now(),
            })?
        };

        let span = Span::from_utc(accepted.start, accepted.end);
        validate_span(&span)?;

        let _gate = self.compaction.read().await;
        let mut guard = ps.write().await;
        if guard.scheduled_count() >= MAX_APPOINTMENTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many appointments for provider"));
        }
        if self.entity_to_provider.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if let Err(violation) = check_exclusion(&guard, &span) {
            debug!(
                "booking {} lost to {} on provider {}",
                req.id, violation.existing, req.provider_id
            );
            return Err(violation.into());
        }

        let event = Event::AppointmentBooked {
            id: req.id,
            clinic_id: accepted.clinic_id,
            provider_id: accepted.provider_id,
            patient_id: req.patient_id,
            service_id: accepted.service_id,
            span,
            notes: req.notes,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            "booked {} for patient {} with provider {} at {}",
            req.id, req.patient_id, req.provider_id, accepted.start
        );

        guard
            .appointment(req.id)
            .map(AppointmentInfo::from)
            .ok_or(EngineError::not_found("appointment", req.id))
    }

    /// `scheduled → cancelled`, guarded by the cancellation policy. The
    /// status check and the write happen under the same lock.
    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        actor: Option<&Actor>,
    ) -> Result<AppointmentInfo, EngineError> {
        let result = self.cancel_appointment_inner(id, actor).await;
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        result
    }

    async fn cancel_appointment_inner(
        &self,
        id: Ulid,
        actor: Option<&Actor>,
    ) -> Result<AppointmentInfo, EngineError> {
        if actor.is_none() {
            return Err(Rejection::Unauthenticated.into());
        }
        let _gate = self.compaction.read().await;
        let mut guard = self.resolve_entity_write("appointment", &id).await?;
        let appt = guard
            .appointment(id)
            .ok_or(EngineError::not_found("appointment", id))?;
        let view = AppointmentView {
            patient_id: appt.patient_id,
            start: appt.span.start_utc(),
            status: appt.status,
        };
        authorize_cancel(actor, &view, now())?;

        let event = Event::AppointmentCancelled { id, provider_id: guard.id() };
        self.persist_and_apply(&mut guard, &event).await?;
        if let Some(actor) = actor {
            info!("appointment {id} cancelled by {actor}");
        }

        guard
            .appointment(id)
            .map(AppointmentInfo::from)
            .ok_or(EngineError::not_found("appointment", id))
    }

    /// Scheduled appointments whose end is at or before `now`, as
    /// `(appointment_id, provider_id)`. Providers locked by a writer are
    /// skipped and picked up on the next pass.
    pub fn collect_due_appointments(&self, now: DateTime<Utc>) -> Vec<(Ulid, Ulid)> {
        let now_ms = to_ms(now);
        let mut due = Vec::new();
        for entry in self.providers.iter() {
            if let Ok(guard) = entry.value().try_read() {
                due.extend(
                    guard
                        .appointments
                        .iter()
                        .filter(|a| a.status == AppointmentStatus::Scheduled && a.span.end <= now_ms)
                        .map(|a| (a.id, guard.id())),
                );
            }
        }
        due
    }

    /// `scheduled → completed`. Returns false when the appointment is no
    /// longer scheduled or has not ended yet.
    pub async fn complete_appointment(&self, id: Ulid, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let _gate = self.compaction.read().await;
        let mut guard = self.resolve_entity_write("appointment", &id).await?;
        let appt = guard
            .appointment(id)
            .ok_or(EngineError::not_found("appointment", id))?;
        if !appt.status.can_transition_to(AppointmentStatus::Completed) || appt.span.end > to_ms(now) {
            return Ok(false);
        }
        let event = Event::AppointmentCompleted { id, provider_id: guard.id() };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::APPOINTMENTS_COMPLETED_TOTAL).increment(1);
        Ok(true)
    }

    /// Complete every appointment that has ended. Returns how many moved.
    pub async fn complete_due_appointments(&self, now: DateTime<Utc>) -> usize {
        let mut completed = 0;
        for (id, provider_id) in self.collect_due_appointments(now) {
            match self.complete_appointment(id, now).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => debug!("completion skip {id} (provider {provider_id}): {e}"),
            }
        }
        completed
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction.write().await;
        let mut events = Vec::new();

        for entry in self.clinics.iter() {
            let c = entry.value();
            events.push(Event::ClinicCreated {
                id: c.id,
                name: c.name.clone(),
                timezone: c.timezone_name().map(str::to_string),
                address: c.address.clone(),
            });
        }
        for entry in self.patients.iter() {
            let p = entry.value();
            events.push(Event::PatientCreated {
                id: p.id,
                name: p.name.clone(),
                phone: p.phone.clone(),
            });
        }
        for entry in self.services.iter() {
            let s = entry.value();
            events.push(Event::ServiceCreated {
                id: s.id,
                clinic_id: s.clinic_id,
                name: s.name.clone(),
                duration_min: s.duration_min,
            });
        }

        let providers: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        for ps in providers {
            let guard = ps.read().await;
            let p = &guard.provider;
            events.push(Event::ProviderCreated {
                id: p.id,
                clinic_id: p.clinic_id,
                name: p.name.clone(),
                speciality: p.speciality.clone(),
            });
            for w in &guard.windows {
                events.push(Event::AvailabilityAdded {
                    id: w.id,
                    provider_id: p.id,
                    weekday: w.window.weekday,
                    start: w.window.start,
                    end: w.window.end,
                });
            }
            for a in &guard.appointments {
                events.push(Event::AppointmentBooked {
                    id: a.id,
                    clinic_id: a.clinic_id,
                    provider_id: a.provider_id,
                    patient_id: a.patient_id,
                    service_id: a.service_id,
                    span: a.span,
                    notes: a.notes.clone(),
                });
                match a.status {
                    AppointmentStatus::Scheduled => {}
                    AppointmentStatus::Cancelled => {
                        events.push(Event::AppointmentCancelled { id: a.id, provider_id: p.id })
                    }
                    AppointmentStatus::Completed => {
                        events.push(Event::AppointmentCompleted { id: a.id, provider_id: p.id })
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
