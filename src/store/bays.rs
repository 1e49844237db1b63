use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::MAX_BAYS;
use crate::model::*;

use super::{BayStore, Store, StoreError};

impl Store {
    /// Compare-and-swap on the occupant index. `Ok(true)` when this call
    /// created the entry, `Ok(false)` when the same pair was already claimed.
    fn claim_occupant(&self, appointment_id: Ulid, bay_id: Ulid) -> Result<bool, StoreError> {
        match self.occupants.entry(appointment_id) {
            Entry::Occupied(e) if *e.get() != bay_id => Err(StoreError::OccupantTaken {
                appointment_id,
                bay_id: *e.get(),
            }),
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(bay_id);
                Ok(true)
            }
        }
    }

    fn release_occupant(&self, appointment_id: Ulid, bay_id: Ulid) {
        self.occupants
            .remove_if(&appointment_id, |_, holder| *holder == bay_id);
    }
}

#[async_trait]
impl BayStore for Store {
    async fn get_bay(&self, id: Ulid) -> Option<Bay> {
        Self::read_doc(&self.bays, &id).await
    }

    async fn list_bays(&self) -> Vec<Bay> {
        Self::snapshot(&self.bays).await
    }

    async fn insert_bay(&self, bay: Bay) -> Result<(), StoreError> {
        let _gate = self.write_gate().await;
        if self.bays.len() >= MAX_BAYS {
            return Err(StoreError::LimitExceeded("too many bays"));
        }
        let id = bay.id;
        if self.bays.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        match self.bay_numbers.entry(bay.number) {
            Entry::Occupied(e) => {
                return Err(StoreError::DuplicateBayNumber {
                    number: bay.number,
                    existing: *e.get(),
                });
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        if let Err(e) = self.persist(Event::BaySaved(bay.clone())).await {
            self.bay_numbers.remove_if(&bay.number, |_, holder| *holder == id);
            return Err(e);
        }
        self.bays.insert(id, Arc::new(RwLock::new(bay)));
        Ok(())
    }

    async fn bay_for_appointment(&self, appointment_id: Ulid) -> Option<Bay> {
        let bay_id = self.occupants.get(&appointment_id).map(|e| *e.value())?;
        self.get_bay(bay_id)
            .await
            .filter(|bay| bay.current_booking == Some(appointment_id))
    }

    async fn seat_bay(&self, bay_id: Ulid, appointment_id: Ulid) -> Result<Bay, StoreError> {
        let _gate = self.write_gate().await;
        if !self.bays.contains_key(&bay_id) {
            return Err(StoreError::NotFound(bay_id));
        }
        let claimed = self.claim_occupant(appointment_id, bay_id)?;
        let rollback = |store: &Self| {
            if claimed {
                store.release_occupant(appointment_id, bay_id);
            }
        };

        let mut guard = match Self::lock_doc(&self.bays, bay_id).await {
            Ok(guard) => guard,
            Err(e) => {
                rollback(self);
                return Err(e);
            }
        };
        match (guard.status, guard.current_booking) {
            (BayStatus::Available, _) => {}
            (BayStatus::Occupied, Some(current)) if current == appointment_id => {
                return Ok(guard.clone());
            }
            (status, current_booking) => {
                rollback(self);
                return Err(StoreError::BayNotAvailable {
                    bay_id,
                    status,
                    current_booking,
                });
            }
        }

        let mut updated = guard.clone();
        updated.seat(appointment_id);
        if let Err(e) = self.persist(Event::BaySaved(updated.clone())).await {
            rollback(self);
            return Err(e);
        }
        *guard = updated.clone();
        Ok(updated)
    }

    async fn vacate_bay(&self, bay_id: Ulid) -> Result<Bay, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = Self::lock_doc(&self.bays, bay_id).await?;
        if guard.status == BayStatus::Available && guard.current_booking.is_none() {
            return Ok(guard.clone());
        }

        let previous = guard.current_booking;
        let mut updated = guard.clone();
        updated.vacate();
        self.persist(Event::BaySaved(updated.clone())).await?;
        *guard = updated.clone();
        if let Some(appointment_id) = previous {
            self.release_occupant(appointment_id, bay_id);
        }
        Ok(updated)
    }

    async fn vacate_bay_if_held(
        &self,
        bay_id: Ulid,
        appointment_id: Ulid,
    ) -> Result<Option<Bay>, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = Self::lock_doc(&self.bays, bay_id).await?;
        if guard.current_booking != Some(appointment_id) {
            return Ok(None);
        }

        let mut updated = guard.clone();
        updated.vacate();
        self.persist(Event::BaySaved(updated.clone())).await?;
        *guard = updated.clone();
        self.release_occupant(appointment_id, bay_id);
        Ok(Some(updated))
    }

    async fn set_bay_maintenance(&self, bay_id: Ulid, on: bool) -> Result<Bay, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = Self::lock_doc(&self.bays, bay_id).await?;
        if guard.current_booking.is_some() {
            return Err(StoreError::BayOccupied {
                bay_id,
                status: guard.status,
            });
        }
        let target = if on {
            BayStatus::Maintenance
        } else {
            BayStatus::Available
        };
        if guard.status == target {
            return Ok(guard.clone());
        }

        let mut updated = guard.clone();
        updated.set_maintenance(on);
        self.persist(Event::BaySaved(updated.clone())).await?;
        *guard = updated.clone();
        Ok(updated)
    }

    async fn update_bay_details(
        &self,
        bay_id: Ulid,
        last_maintenance: Option<Ms>,
        notes: Option<String>,
    ) -> Result<Bay, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = Self::lock_doc(&self.bays, bay_id).await?;
        let mut updated = guard.clone();
        if last_maintenance.is_some() {
            updated.last_maintenance = last_maintenance;
        }
        if notes.is_some() {
            updated.notes = notes;
        }
        updated.updated_at = now_ms();
        self.persist(Event::BaySaved(updated.clone())).await?;
        *guard = updated.clone();
        Ok(updated)
    }

    async fn remove_bay(&self, bay_id: Ulid) -> Result<Bay, StoreError> {
        let _gate = self.write_gate().await;
        let guard = Self::lock_doc(&self.bays, bay_id).await?;
        if guard.status != BayStatus::Available {
            return Err(StoreError::BayOccupied {
                bay_id,
                status: guard.status,
            });
        }
        self.persist(Event::BayDeleted { id: bay_id }).await?;
        let removed = guard.clone();
        self.bays.remove(&bay_id);
        self.bay_numbers
            .remove_if(&removed.number, |_, holder| *holder == bay_id);
        Ok(removed)
    }
}
