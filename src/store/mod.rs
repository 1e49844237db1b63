//! Process-local document store.
//!
//! Each document sits behind its own `RwLock`; a write is one
//! read-modify-write under that lock, appended to the WAL before it becomes
//! visible. There is no cross-document transaction. Cross-document
//! uniqueness (bay numbers, bay occupants, service slots) is enforced by
//! index entries claimed with a DashMap compare-and-swap before the
//! document write, and rolled back if that write fails.

mod appointments;
mod bays;
mod error;
mod notifications;
mod progress;

pub use error::StoreError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, RwLockReadGuard, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::*;
use crate::wal::Wal;

pub type Doc<T> = Arc<RwLock<T>>;

// ── Leaf abstractions consumed by the services ───────────────────

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn get_appointment(&self, id: Ulid) -> Option<Appointment>;

    async fn list_appointments(&self) -> Vec<Appointment>;

    /// Fails with `SlotTaken` if a live appointment already holds the slot.
    async fn insert_appointment(&self, appointment: Appointment) -> Result<(), StoreError>;

    /// Conditional status write: applies only if the stored status is still
    /// `expected`. A `note` of `Some` replaces the staff note.
    async fn compare_and_set_status(
        &self,
        id: Ulid,
        expected: AppointmentStatus,
        next: AppointmentStatus,
        note: Option<String>,
    ) -> Result<Appointment, StoreError>;
}

#[async_trait]
pub trait BayStore: Send + Sync {
    async fn get_bay(&self, id: Ulid) -> Option<Bay>;

    async fn list_bays(&self) -> Vec<Bay>;

    async fn insert_bay(&self, bay: Bay) -> Result<(), StoreError>;

    /// The bay whose `current_booking` is this appointment, if any.
    async fn bay_for_appointment(&self, appointment_id: Ulid) -> Option<Bay>;

    /// Occupy an available bay. Claims the appointment in the occupant index
    /// first, so one appointment can never be seated at two bays. Re-seating
    /// the same pair is a no-op.
    async fn seat_bay(&self, bay_id: Ulid, appointment_id: Ulid) -> Result<Bay, StoreError>;

    /// Clear the occupant and mark the bay available, whatever its state.
    async fn vacate_bay(&self, bay_id: Ulid) -> Result<Bay, StoreError>;

    /// Vacate only while the bay still holds `appointment_id`. `Ok(None)`
    /// if it has moved on, so a stale caller never evicts a newer booking.
    async fn vacate_bay_if_held(
        &self,
        bay_id: Ulid,
        appointment_id: Ulid,
    ) -> Result<Option<Bay>, StoreError>;

    async fn set_bay_maintenance(&self, bay_id: Ulid, on: bool) -> Result<Bay, StoreError>;

    async fn update_bay_details(
        &self,
        bay_id: Ulid,
        last_maintenance: Option<Ms>,
        notes: Option<String>,
    ) -> Result<Bay, StoreError>;

    /// Only an available bay may be removed.
    async fn remove_bay(&self, bay_id: Ulid) -> Result<Bay, StoreError>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_progress(&self, id: Ulid) -> Option<RepairProgress>;

    async fn list_progress(&self) -> Vec<RepairProgress>;

    async fn insert_progress(&self, progress: RepairProgress) -> Result<(), StoreError>;

    async fn replace_progress(&self, progress: RepairProgress) -> Result<(), StoreError>;

    async fn remove_progress(&self, id: Ulid) -> Result<RepairProgress, StoreError>;
}

/// Append-only outbox read by the account owner.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn push_notification(&self, notification: Notification) -> Result<(), StoreError>;

    async fn get_notification(&self, id: Ulid) -> Option<Notification>;

    async fn notifications_for(&self, recipient: Ulid) -> Vec<Notification>;

    async fn mark_notification_read(&self, id: Ulid) -> Result<Notification, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────────────

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

/// Owns the WAL. Appends that queue up while a flush is pending are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("wal writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so half-buffered bytes do not leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
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
            let result = Wal::stage_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Store ────────────────────────────────────────────────────────

pub struct Store {
    pub(super) appointments: DashMap<Ulid, Doc<Appointment>>,
    pub(super) bays: DashMap<Ulid, Doc<Bay>>,
    pub(super) progress: DashMap<Ulid, Doc<RepairProgress>>,
    pub(super) notifications: DashMap<Ulid, Doc<Notification>>,
    /// Unique index: bay number → bay id.
    pub(super) bay_numbers: DashMap<u32, Ulid>,
    /// Unique index over non-null `Bay::current_booking`: appointment id → bay id.
    pub(super) occupants: DashMap<Ulid, Ulid>,
    /// Unique index over live service slots.
    pub(super) slots: DashMap<SlotKey, Ulid>,
    /// Writers hold it shared; compaction holds it exclusively so no append
    /// lands between the snapshot and the log swap.
    pub(super) gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Store {
    /// Recover the WAL at `wal_path` and start the background writer.
    /// Must be called inside a Tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            appointments: DashMap::new(),
            bays: DashMap::new(),
            progress: DashMap::new(),
            notifications: DashMap::new(),
            bay_numbers: DashMap::new(),
            occupants: DashMap::new(),
            slots: DashMap::new(),
            gate: RwLock::new(()),
            wal_tx,
        };
        let replayed = events.len();
        store.rebuild(events);
        tracing::info!(
            "store opened at {}: {replayed} events, {} appointments, {} bays",
            wal_path.display(),
            store.appointments.len(),
            store.bays.len()
        );
        Ok(store)
    }

    /// Last save wins; indexes are derived from the final documents.
    fn rebuild(&self, events: Vec<Event>) {
        let mut appointments = HashMap::new();
        let mut bays = HashMap::new();
        let mut progress = HashMap::new();
        let mut notifications = HashMap::new();
        for event in events {
            match event {
                Event::AppointmentSaved(a) => {
                    appointments.insert(a.id, a);
                }
                Event::BaySaved(b) => {
                    bays.insert(b.id, b);
                }
                Event::BayDeleted { id } => {
                    bays.remove(&id);
                }
                Event::ProgressSaved(p) => {
                    progress.insert(p.id, p);
                }
                Event::ProgressDeleted { id } => {
                    progress.remove(&id);
                }
                Event::NotificationSaved(n) => {
                    notifications.insert(n.id, n);
                }
            }
        }

        for (id, appt) in appointments {
            if crate::lifecycle::holds_slot(appt.status)
                && let Some(key) = appt.slot_key()
            {
                self.slots.insert(key, id);
            }
            self.appointments.insert(id, Arc::new(RwLock::new(appt)));
        }
        for (id, bay) in bays {
            self.bay_numbers.insert(bay.number, id);
            if let Some(appt) = bay.current_booking
                && let Some(previous) = self.occupants.insert(appt, id)
            {
                tracing::warn!("replay: appointment {appt} referenced by bays {previous} and {id}");
            }
            self.bays.insert(id, Arc::new(RwLock::new(bay)));
        }
        for (id, p) in progress {
            self.progress.insert(id, Arc::new(RwLock::new(p)));
        }
        for (id, n) in notifications {
            self.notifications.insert(id, Arc::new(RwLock::new(n)));
        }
    }

    /// Shared side of the compaction gate. Held for the whole of a mutation.
    pub(super) async fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Append to the WAL via the background group-commit writer.
    pub(super) async fn persist(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub(super) async fn snapshot<T: Clone>(map: &DashMap<Ulid, Doc<T>>) -> Vec<T> {
        let docs: Vec<Doc<T>> = map.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(doc.read().await.clone());
        }
        out
    }

    pub(super) async fn read_doc<T: Clone>(map: &DashMap<Ulid, Doc<T>>, id: &Ulid) -> Option<T> {
        let doc = map.get(id).map(|e| e.value().clone())?;
        let value = doc.read().await.clone();
        Some(value)
    }

    /// Write-lock a document, confirming it was not removed while we waited.
    pub(super) async fn lock_doc<T>(
        map: &DashMap<Ulid, Doc<T>>,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<T>, StoreError> {
        let doc = map
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))?;
        let guard = doc.clone().write_owned().await;
        let still_live = map.get(&id).is_some_and(|e| Arc::ptr_eq(e.value(), &doc));
        if !still_live {
            return Err(StoreError::NotFound(id));
        }
        Ok(guard)
    }

    pub fn appointment_count(&self) -> usize {
        self.appointments.len()
    }

    pub fn bay_count(&self) -> usize {
        self.bays.len()
    }

    /// Rewrite the WAL as one save per live document.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;

        let mut events = Vec::new();
        events.extend(Self::snapshot(&self.appointments).await.into_iter().map(Event::AppointmentSaved));
        events.extend(Self::snapshot(&self.bays).await.into_iter().map(Event::BaySaved));
        events.extend(Self::snapshot(&self.progress).await.into_iter().map(Event::ProgressSaved));
        events.extend(
            Self::snapshot(&self.notifications)
                .await
                .into_iter()
                .map(Event::NotificationSaved),
        );
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        tracing::info!("compacted WAL to {count} events");
        Ok(())
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
