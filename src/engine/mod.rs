mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;
pub use mutations::BookAppointment;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::schedule::{AppointmentStatus, AvailabilityWindow};
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Non-appends wait until the current batch is durable.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One tenant's booking store.
///
/// Catalog records (clinics, patients, services) are immutable once written
/// and live directly in their maps. Everything that changes (availability
/// windows, appointments) sits behind one lock per provider, which is what
/// serialises bookings for that provider.
pub struct Engine {
    pub(super) clinics: DashMap<Ulid, Clinic>,
    pub(super) patients: DashMap<Ulid, Patient>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) providers: DashMap<Ulid, SharedProviderState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: appointment / availability id → provider id.
    pub(super) entity_to_provider: DashMap<Ulid, Ulid>,
    /// Held shared by every write path (taken before any provider lock) and
    /// exclusively by compaction, so a snapshot never misses an append.
    pub(super) compaction: RwLock<()>,
}

fn parse_zone(name: Option<&str>) -> Option<Tz> {
    name.and_then(|n| n.parse::<Tz>().ok())
}

/// Apply an event directly to a ProviderState (no locking, caller holds the lock).
fn apply_to_provider(ps: &mut ProviderState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AvailabilityAdded {
            id,
            provider_id,
            weekday,
            start,
            end,
        } => {
            ps.add_window(AvailabilityRecord {
                id: *id,
                provider_id: *provider_id,
                window: AvailabilityWindow {
                    weekday: *weekday,
                    start: *start,
                    end: *end,
                },
            });
            entity_map.insert(*id, *provider_id);
        }
        Event::AvailabilityRemoved { id, .. } => {
            ps.remove_window(*id);
            entity_map.remove(id);
        }
        Event::AppointmentBooked {
            id,
            clinic_id,
            provider_id,
            patient_id,
            service_id,
            span,
            notes,
        } => {
            ps.insert_appointment(Appointment {
                id: *id,
                clinic_id: *clinic_id,
                provider_id: *provider_id,
                patient_id: *patient_id,
                service_id: *service_id,
                span: *span,
                status: AppointmentStatus::Scheduled,
                notes: notes.clone(),
            });
            entity_map.insert(*id, *provider_id);
        }
        Event::AppointmentCancelled { id, .. } => {
            if let Some(appt) = ps.appointment_mut(*id) {
                appt.status = AppointmentStatus::Cancelled;
            }
        }
        Event::AppointmentCompleted { id, .. } => {
            if let Some(appt) = ps.appointment_mut(*id) {
                appt.status = AppointmentStatus::Completed;
            }
        }
        // Catalog events are handled at the map level, not here.
        Event::ClinicCreated { .. }
        | Event::ProviderCreated { .. }
        | Event::PatientCreated { .. }
        | Event::ServiceCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            clinics: DashMap::new(),
            patients: DashMap::new(),
            services: DashMap::new(),
            providers: DashMap::new(),
            wal_tx,
            entity_to_provider: DashMap::new(),
            compaction: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context
        // (lazy tenant creation).
        for event in &events {
            if engine.apply_catalog(event) {
                continue;
            }
            if let Some(provider_id) = event_provider_id(event)
                && let Some(entry) = engine.providers.get(&provider_id)
                && let Ok(mut guard) = entry.value().try_write()
            {
                apply_to_provider(&mut guard, event, &engine.entity_to_provider);
            }
        }

        tracing::debug!(
            "replayed {} events: {} clinics, {} providers",
            events.len(),
            engine.clinics.len(),
            engine.providers.len()
        );
        Ok(engine)
    }

    /// Apply a catalog event to the maps. Returns false for per-provider events.
    fn apply_catalog(&self, event: &Event) -> bool {
        match event {
            Event::ClinicCreated {
                id,
                name,
                timezone,
                address,
            } => {
                self.clinics.insert(
                    *id,
                    Clinic {
                        id: *id,
                        name: name.clone(),
                        zone: parse_zone(timezone.as_deref()),
                        address: address.clone(),
                    },
                );
            }
            Event::ProviderCreated {
                id,
                clinic_id,
                name,
                speciality,
            } => {
                let ps = ProviderState::new(Provider {
                    id: *id,
                    clinic_id: *clinic_id,
                    name: name.clone(),
                    speciality: speciality.clone(),
                });
                self.providers.insert(*id, Arc::new(RwLock::new(ps)));
            }
            Event::PatientCreated { id, name, phone } => {
                self.patients.insert(
                    *id,
                    Patient {
                        id: *id,
                        name: name.clone(),
                        phone: phone.clone(),
                    },
                );
            }
            Event::ServiceCreated {
                id,
                clinic_id,
                name,
                duration_min,
            } => {
                self.services.insert(
                    *id,
                    Service {
                        id: *id,
                        clinic_id: *clinic_id,
                        name: name.clone(),
                        duration_min: *duration_min,
                    },
                );
            }
            _ => return false,
        }
        true
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub(super) fn provider_or_not_found(&self, id: Ulid) -> Result<SharedProviderState, EngineError> {
        self.get_provider(&id)
            .ok_or(EngineError::not_found("provider", id))
    }

    pub fn clinic(&self, id: &Ulid) -> Option<Clinic> {
        self.clinics.get(id).map(|e| e.value().clone())
    }

    pub fn service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn patient(&self, id: &Ulid) -> Option<Patient> {
        self.patients.get(id).map(|e| e.value().clone())
    }

    pub fn get_provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    /// Zone of the clinic a provider works at.
    pub(super) fn provider_zone(&self, provider: &Provider) -> Result<Option<Tz>, EngineError> {
        self.clinic(&provider.clinic_id)
            .map(|c| c.zone)
            .ok_or(EngineError::not_found("clinic", provider.clinic_id))
    }

    /// WAL-append, then apply to the locked provider state.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event, &self.entity_to_provider);
        Ok(())
    }

    /// WAL-append, then insert a catalog record.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.compaction.read().await;
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    /// Lookup entity → provider, get the provider, acquire its write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity: &'static str,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let provider_id = self
            .get_provider_for_entity(entity_id)
            .ok_or(EngineError::not_found(entity, *entity_id))?;
        let ps = self.provider_or_not_found(provider_id)?;
        Ok(ps.write_owned().await)
    }
}

/// The provider a per-provider event belongs to.
fn event_provider_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AvailabilityAdded { provider_id, .. }
        | Event::AvailabilityRemoved { provider_id, .. }
        | Event::AppointmentBooked { provider_id, .. }
        | Event::AppointmentCancelled { provider_id, .. }
        | Event::AppointmentCompleted { provider_id, .. } => Some(*provider_id),
        Event::ClinicCreated { .. }
        | Event::ProviderCreated { .. }
        | Event::PatientCreated { .. }
        | Event::ServiceCreated { .. } => None,
    }
}
