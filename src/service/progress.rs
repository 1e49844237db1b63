use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::lifecycle;
use crate::limits::MAX_NOTE_LEN;
use crate::model::*;
use crate::store::ProgressStore;

use super::{BayAssignmentService, WorkflowError, Write, check_opt_len, paginate, require_role};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressFilter {
    pub appointment_id: Option<Ulid>,
    pub status: Option<ProgressStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewProgress {
    pub id: Option<Ulid>,
    pub appointment_id: Ulid,
    pub status: String,
    pub notes: Option<String>,
    pub estimated_completion: Option<Ms>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub status: Option<String>,
    pub notes: Option<String>,
    pub estimated_completion: Option<Ms>,
    /// With a `completed` status, also release the appointment's bay.
    pub free_bay: bool,
}

/// Technician updates, each row owned by the staff identity that wrote it.
#[derive(Clone)]
pub struct RepairProgressService {
    progress: Arc<dyn ProgressStore>,
    bays: BayAssignmentService,
}

impl RepairProgressService {
    pub fn new(progress: Arc<dyn ProgressStore>, bays: BayAssignmentService) -> Self {
        Self { progress, bays }
    }

    /// The actor's own rows, newest first, hiding rows of cancelled appointments.
    pub async fn list(
        &self,
        actor: &Actor,
        filter: &ProgressFilter,
        page: PageRequest,
    ) -> Result<Page<RepairProgress>, WorkflowError> {
        require_role(actor, Role::Service)?;
        let statuses: HashMap<Ulid, AppointmentStatus> = self
            .bays
            .appointments()
            .all()
            .await
            .into_iter()
            .map(|a| (a.id, a.status))
            .collect();

        let mut rows: Vec<RepairProgress> = self
            .progress
            .list_progress()
            .await
            .into_iter()
            .filter(|p| p.staff_id == actor.identity)
            .filter(|p| statuses.get(&p.appointment_id) != Some(&AppointmentStatus::Cancelled))
            .filter(|p| filter.appointment_id.is_none_or(|id| p.appointment_id == id))
            .filter(|p| filter.status.is_none_or(|s| p.status == s))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        paginate(rows, page)
    }

    /// Progress may be logged before the appointment is seated.
    pub async fn create(&self, actor: &Actor, new: NewProgress) -> Result<RepairProgress, WorkflowError> {
        require_role(actor, Role::Service)?;
        let status: ProgressStatus = new.status.parse()?;
        check_opt_len("notes", new.notes.as_deref(), MAX_NOTE_LEN)?;
        self.bays.appointments().find(new.appointment_id).await?;

        let now = now_ms();
        let row = RepairProgress {
            id: new.id.unwrap_or_else(Ulid::new),
            appointment_id: new.appointment_id,
            staff_id: actor.identity.clone(),
            status,
            notes: new.notes,
            estimated_completion: new.estimated_completion,
            created_at: now,
            updated_at: now,
        };
        self.progress.insert_progress(row.clone()).await?;
        info!(
            "{} logged {} on appointment {}",
            row.staff_id, row.status, row.appointment_id
        );
        Ok(row)
    }

    /// Author-only edit. Moving a row to `completed` completes the
    /// appointment and, with `free_bay`, releases its bay. Re-sending a
    /// completed update retries whichever cascade step did not land.
    pub async fn update(
        &self,
        actor: &Actor,
        id: Ulid,
        update: ProgressUpdate,
    ) -> Result<RepairProgress, WorkflowError> {
        require_role(actor, Role::Service)?;
        let status = update
            .status
            .as_deref()
            .map(str::parse::<ProgressStatus>)
            .transpose()?;
        check_opt_len("notes", update.notes.as_deref(), MAX_NOTE_LEN)?;
        let current = self.owned(actor, id).await?;

        let completing = status == Some(ProgressStatus::Completed);
        if completing {
            let appt = self.bays.appointments().find(current.appointment_id).await?;
            lifecycle::completion_target(appt.status)?;
        }

        let mut row = current.clone();
        if let Some(status) = status {
            row.status = status;
        }
        if update.notes.is_some() {
            row.notes = update.notes;
        }
        if update.estimated_completion.is_some() {
            row.estimated_completion = update.estimated_completion;
        }
        row.updated_at = now_ms();
        self.progress.replace_progress(row.clone()).await?;

        if completing {
            self.cascade_completion(row.appointment_id, update.free_bay).await?;
        }
        Ok(row)
    }

    pub async fn delete(&self, actor: &Actor, id: Ulid) -> Result<RepairProgress, WorkflowError> {
        require_role(actor, Role::Service)?;
        self.owned(actor, id).await?;
        let removed = self.progress.remove_progress(id).await?;
        info!("{} deleted progress {id}", actor.identity);
        Ok(removed)
    }

    /// Appointment first, then the bay.
    async fn cascade_completion(&self, appointment_id: Ulid, free_bay: bool) -> Result<(), WorkflowError> {
        let mut pending = vec![Write::Appointment];
        if free_bay {
            pending.push(Write::Bay);
        }

        if let Err(e) = self.bays.appointments().complete(appointment_id).await {
            metrics::counter!(crate::observability::PARTIAL_SUCCESS_TOTAL, "operation" => "complete_repair")
                .increment(1);
            return Err(WorkflowError::partial(&[Write::RepairProgress], &pending, e));
        }
        if free_bay && let Err(e) = self.bays.release_seated(appointment_id).await {
            metrics::counter!(crate::observability::PARTIAL_SUCCESS_TOTAL, "operation" => "complete_repair")
                .increment(1);
            return Err(WorkflowError::partial(
                &[Write::RepairProgress, Write::Appointment],
                &[Write::Bay],
                e,
            ));
        }
        Ok(())
    }

    async fn owned(&self, actor: &Actor, id: Ulid) -> Result<RepairProgress, WorkflowError> {
        let row = self
            .progress
            .get_progress(id)
            .await
            .ok_or(WorkflowError::NotFound {
                entity: "repair progress",
                id,
            })?;
        if row.staff_id != actor.identity {
            return Err(WorkflowError::Forbidden(format!(
                "repair progress {id} belongs to another technician"
            )));
        }
        Ok(row)
    }
}
