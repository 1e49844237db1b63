use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::{MAX_BAYS, MAX_NOTE_LEN};
use crate::model::*;
use crate::store::{BayStore, StoreError};

use super::{AppointmentService, WorkflowError, Write, check_opt_len, paginate, require_role};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BayFilter {
    pub status: Option<BayStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBay {
    pub id: Option<Ulid>,
    pub number: u32,
    pub notes: Option<String>,
    pub last_maintenance: Option<Ms>,
}

/// Staff patch of a bay. `current_booking: Some(None)` clears the occupant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BayUpdate {
    pub status: Option<BayStatus>,
    pub current_booking: Option<Option<Ulid>>,
    pub last_maintenance: Option<Ms>,
    pub notes: Option<String>,
}

/// Binds confirmed appointments to bays and keeps the two consistent.
#[derive(Clone)]
pub struct BayAssignmentService {
    bays: Arc<dyn BayStore>,
    appointments: AppointmentService,
}

impl BayAssignmentService {
    pub fn new(bays: Arc<dyn BayStore>, appointments: AppointmentService) -> Self {
        Self { bays, appointments }
    }

    /// Sorted by bay number.
    pub async fn list_bays(
        &self,
        actor: &Actor,
        filter: &BayFilter,
        page: PageRequest,
    ) -> Result<Page<Bay>, WorkflowError> {
        require_role(actor, Role::Service)?;
        let mut bays: Vec<Bay> = self
            .bays
            .list_bays()
            .await
            .into_iter()
            .filter(|b| filter.status.is_none_or(|s| b.status == s))
            .collect();
        bays.sort_by_key(|b| b.number);
        paginate(bays, page)
    }

    pub async fn get_bay(&self, actor: &Actor, bay_id: Ulid) -> Result<Bay, WorkflowError> {
        require_role(actor, Role::Service)?;
        self.find(bay_id).await
    }

    pub async fn create_bay(&self, actor: &Actor, new: NewBay) -> Result<Bay, WorkflowError> {
        require_role(actor, Role::Service)?;
        if new.number == 0 {
            return Err(WorkflowError::InvalidInput("bay number starts at 1".into()));
        }
        check_opt_len("notes", new.notes.as_deref(), MAX_NOTE_LEN)?;
        if self.bays.list_bays().await.len() >= MAX_BAYS {
            return Err(WorkflowError::InvalidInput(format!("at most {MAX_BAYS} bays")));
        }
        let bay = Bay::new(
            new.id.unwrap_or_else(Ulid::new),
            new.number,
            new.notes,
            new.last_maintenance,
        );
        self.bays.insert_bay(bay.clone()).await?;
        info!("created bay {} ({})", bay.number, bay.id);
        Ok(bay)
    }

    /// Seat a confirmed appointment at an available bay.
    ///
    /// Writes the bay first, then moves the appointment to `in_progress`.
    /// Calling it again after a partial failure finishes the second write.
    pub async fn assign(
        &self,
        actor: &Actor,
        bay_id: Ulid,
        appointment_id: Ulid,
        target: Option<BayStatus>,
    ) -> Result<Bay, WorkflowError> {
        require_role(actor, Role::Service)?;

        let bay = self.find(bay_id).await?;
        let appt = self.appointments.find(appointment_id).await?;

        match appt.status {
            AppointmentStatus::Confirmed => {}
            AppointmentStatus::InProgress => {
                // already seated somewhere: a no-op here, a conflict elsewhere
                match self.bays.bay_for_appointment(appt.id).await {
                    Some(holder) if holder.id == bay.id => {
                        debug!("appointment {} already seated at bay {}", appt.id, bay.number);
                        return Ok(holder);
                    }
                    Some(holder) => {
                        return Err(WorkflowError::AppointmentAlreadySeated {
                            bay_number: holder.number,
                        });
                    }
                    None => {
                        return Err(WorkflowError::AppointmentNotConfirmed {
                            status: AppointmentStatus::InProgress,
                        });
                    }
                }
            }
            status => return Err(WorkflowError::AppointmentNotConfirmed { status }),
        }
        if let Some(other) = self.bays.bay_for_appointment(appt.id).await
            && other.id != bay.id
        {
            return Err(WorkflowError::AppointmentAlreadySeated {
                bay_number: other.number,
            });
        }
        if let Some(status) = target
            && status != BayStatus::Occupied
        {
            return Err(WorkflowError::InconsistentBayState(format!(
                "a bay given an appointment must be occupied, not {status}"
            )));
        }
        if appt.kind != AppointmentKind::Service {
            return Err(WorkflowError::InvalidInput(
                "only service appointments can be seated at a bay".into(),
            ));
        }
        let seatable = bay.status == BayStatus::Available || bay.current_booking == Some(appt.id);
        if !seatable {
            return Err(WorkflowError::BayUnavailable {
                bay_number: bay.number,
                status: bay.status,
            });
        }

        let seated = match self.bays.seat_bay(bay.id, appt.id).await {
            Ok(seated) => seated,
            Err(e) => return Err(self.seat_error(&bay, e).await),
        };
        if let Err(e) = self
            .appointments
            .transition(&appt, AppointmentStatus::InProgress, None)
            .await
        {
            if let WorkflowError::ConcurrentUpdate {
                actual: AppointmentStatus::InProgress,
            } = e
            {
                return Ok(seated);
            }
            metrics::counter!(crate::observability::PARTIAL_SUCCESS_TOTAL, "operation" => "assign")
                .increment(1);
            return Err(WorkflowError::partial(&[Write::Bay], &[Write::Appointment], e));
        }

        metrics::counter!(crate::observability::BAY_ASSIGNMENTS_TOTAL).increment(1);
        info!("seated appointment {} at bay {}", appt.id, bay.number);
        Ok(seated)
    }

    /// Clear the bay whatever it holds. Never touches the appointment.
    pub async fn release(&self, actor: &Actor, bay_id: Ulid) -> Result<Bay, WorkflowError> {
        require_role(actor, Role::Service)?;
        self.vacate(bay_id, "staff").await
    }

    pub async fn set_maintenance(&self, actor: &Actor, bay_id: Ulid, on: bool) -> Result<Bay, WorkflowError> {
        require_role(actor, Role::Service)?;
        let bay = self.find(bay_id).await?;
        let updated = self
            .bays
            .set_bay_maintenance(bay_id, on)
            .await
            .map_err(|e| self.occupied_error(&bay, e))?;
        info!("bay {} maintenance {}", bay.number, if on { "on" } else { "off" });
        Ok(updated)
    }

    /// Apply a staff patch: occupant change first, then a plain status
    /// change, then the maintenance date and notes.
    pub async fn update_bay(&self, actor: &Actor, bay_id: Ulid, update: BayUpdate) -> Result<Bay, WorkflowError> {
        require_role(actor, Role::Service)?;
        check_opt_len("notes", update.notes.as_deref(), MAX_NOTE_LEN)?;
        let mut bay = self.find(bay_id).await?;

        match (update.current_booking, update.status) {
            (Some(Some(appointment_id)), target) => {
                bay = self.assign(actor, bay_id, appointment_id, target).await?;
            }
            (_, Some(BayStatus::Occupied)) => {
                return Err(WorkflowError::InconsistentBayState(
                    "occupied needs a current_booking".into(),
                ));
            }
            (Some(None), status) => {
                bay = self.release(actor, bay_id).await?;
                if status == Some(BayStatus::Maintenance) {
                    bay = self.set_maintenance(actor, bay_id, true).await?;
                }
            }
            (None, Some(BayStatus::Available)) => {
                bay = match bay.status {
                    BayStatus::Maintenance => self.set_maintenance(actor, bay_id, false).await?,
                    BayStatus::Occupied => self.release(actor, bay_id).await?,
                    BayStatus::Available => bay,
                };
            }
            (None, Some(BayStatus::Maintenance)) => {
                bay = self.set_maintenance(actor, bay_id, true).await?;
            }
            (None, None) => {}
        }

        if update.last_maintenance.is_some() || update.notes.is_some() {
            bay = self
                .bays
                .update_bay_details(bay_id, update.last_maintenance, update.notes)
                .await?;
        }
        Ok(bay)
    }

    /// Only an available bay can be deleted.
    pub async fn delete(&self, actor: &Actor, bay_id: Ulid) -> Result<Bay, WorkflowError> {
        require_role(actor, Role::Service)?;
        let bay = self.find(bay_id).await?;
        let removed = self
            .bays
            .remove_bay(bay_id)
            .await
            .map_err(|e| self.occupied_error(&bay, e))?;
        info!("deleted bay {}", removed.number);
        Ok(removed)
    }

    /// Completion-cascade release: frees whichever bay holds the
    /// appointment. No bay is not an error.
    pub(crate) async fn release_seated(&self, appointment_id: Ulid) -> Result<Option<Bay>, WorkflowError> {
        match self.bays.bay_for_appointment(appointment_id).await {
            Some(bay) => self.vacate_if_held(bay.id, appointment_id, "completion").await,
            None => {
                debug!("appointment {appointment_id} holds no bay; nothing to release");
                Ok(None)
            }
        }
    }

    async fn vacate(&self, bay_id: Ulid, cause: &'static str) -> Result<Bay, WorkflowError> {
        let released = self.bays.vacate_bay(bay_id).await.map_err(bay_not_found)?;
        metrics::counter!(crate::observability::BAY_RELEASES_TOTAL, "cause" => cause).increment(1);
        info!("released bay {} ({cause})", released.number);
        Ok(released)
    }

    /// Release `bay_id` only if it still holds `appointment_id`.
    pub(crate) async fn vacate_if_held(
        &self,
        bay_id: Ulid,
        appointment_id: Ulid,
        cause: &'static str,
    ) -> Result<Option<Bay>, WorkflowError> {
        let released = self
            .bays
            .vacate_bay_if_held(bay_id, appointment_id)
            .await
            .map_err(bay_not_found)?;
        if let Some(bay) = &released {
            metrics::counter!(crate::observability::BAY_RELEASES_TOTAL, "cause" => cause).increment(1);
            info!("released bay {} from appointment {appointment_id} ({cause})", bay.number);
        }
        Ok(released)
    }

    pub(crate) async fn all(&self) -> Vec<Bay> {
        self.bays.list_bays().await
    }

    pub(crate) async fn holder_of(&self, appointment_id: Ulid) -> Option<Bay> {
        self.bays.bay_for_appointment(appointment_id).await
    }

    pub(crate) fn appointments(&self) -> &AppointmentService {
        &self.appointments
    }

    async fn find(&self, bay_id: Ulid) -> Result<Bay, WorkflowError> {
        self.bays
            .get_bay(bay_id)
            .await
            .ok_or(WorkflowError::NotFound { entity: "bay", id: bay_id })
    }

    /// Translate a failed seat, naming bays by number.
    async fn seat_error(&self, bay: &Bay, e: StoreError) -> WorkflowError {
        match e {
            StoreError::NotFound(id) => WorkflowError::NotFound { entity: "bay", id },
            StoreError::OccupantTaken { bay_id, .. } => {
                // lost a race: another bay claimed the appointment after our pre-check
                let bay_number = match self.bays.get_bay(bay_id).await {
                    Some(other) => other.number,
                    None => bay.number,
                };
                WorkflowError::AppointmentAlreadySeated { bay_number }
            }
            StoreError::BayNotAvailable { status, .. } => WorkflowError::BayUnavailable {
                bay_number: bay.number,
                status,
            },
            other => other.into(),
        }
    }

    fn occupied_error(&self, bay: &Bay, e: StoreError) -> WorkflowError {
        match e {
            StoreError::NotFound(id) => WorkflowError::NotFound { entity: "bay", id },
            StoreError::BayOccupied { status, .. } => WorkflowError::BayOccupied {
                bay_number: bay.number,
                status,
            },
            other => other.into(),
        }
    }
}

fn bay_not_found(e: StoreError) -> WorkflowError {
    match e {
        StoreError::NotFound(id) => WorkflowError::NotFound { entity: "bay", id },
        other => other.into(),
    }
}
