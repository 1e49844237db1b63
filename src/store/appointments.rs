use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::lifecycle::holds_slot;
use crate::model::*;

use super::{AppointmentStore, Store, StoreError};

impl Store {
    fn claim_slot(&self, key: &SlotKey, id: Ulid) -> Result<bool, StoreError> {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(e) if *e.get() != id => Err(StoreError::SlotTaken { holder: *e.get() }),
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(id);
                Ok(true)
            }
        }
    }

    fn release_slot(&self, key: &SlotKey, id: Ulid) {
        self.slots.remove_if(key, |_, holder| *holder == id);
    }
}

#[async_trait]
impl AppointmentStore for Store {
    async fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        Self::read_doc(&self.appointments, &id).await
    }

    async fn list_appointments(&self) -> Vec<Appointment> {
        Self::snapshot(&self.appointments).await
    }

    async fn insert_appointment(&self, appointment: Appointment) -> Result<(), StoreError> {
        let _gate = self.write_gate().await;
        let id = appointment.id;
        if self.appointments.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }

        let slot = appointment
            .slot_key()
            .filter(|_| holds_slot(appointment.status));
        let claimed = match &slot {
            Some(key) => self.claim_slot(key, id)?,
            None => false,
        };

        if let Err(e) = self.persist(Event::AppointmentSaved(appointment.clone())).await {
            if let (Some(key), true) = (&slot, claimed) {
                self.release_slot(key, id);
            }
            return Err(e);
        }
        self.appointments.insert(id, Arc::new(RwLock::new(appointment)));
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        id: Ulid,
        expected: AppointmentStatus,
        next: AppointmentStatus,
        note: Option<String>,
    ) -> Result<Appointment, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = Self::lock_doc(&self.appointments, id).await?;
        if guard.status != expected {
            return Err(StoreError::StatusMismatch {
                expected,
                actual: guard.status,
            });
        }

        let mut updated = guard.clone();
        updated.status = next;
        if note.is_some() {
            updated.note = note;
        }
        updated.updated_at = now_ms();

        self.persist(Event::AppointmentSaved(updated.clone())).await?;
        *guard = updated.clone();

        if holds_slot(expected)
            && !holds_slot(next)
            && let Some(key) = updated.slot_key()
        {
            self.release_slot(&key, id);
        }
        Ok(updated)
    }
}
