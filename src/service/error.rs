use serde::Serialize;
use ulid::Ulid;

use crate::lifecycle::IllegalTransition;
use crate::model::{AppointmentStatus, BayStatus, UnknownStatus};
use crate::store::StoreError;

/// Taxonomy the transport maps onto its own error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    InvalidStatus,
    IllegalTransition,
    Forbidden,
    Conflict,
    PartialSuccess,
    Internal,
}

/// One document write inside a multi-write workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Write {
    RepairProgress,
    Appointment,
    Bay,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    InvalidStatus(#[from] UnknownStatus),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("appointment is {status}; only confirmed appointments can be seated")]
    AppointmentNotConfirmed { status: AppointmentStatus },
    #[error("appointment is already seated at bay {bay_number}")]
    AppointmentAlreadySeated { bay_number: u32 },
    #[error("inconsistent bay state: {0}")]
    InconsistentBayState(String),
    #[error("bay {bay_number} is {status}")]
    BayOccupied { bay_number: u32, status: BayStatus },
    #[error("bay {bay_number} is {status} and cannot take this appointment")]
    BayUnavailable { bay_number: u32, status: BayStatus },
    #[error("time slot is already booked")]
    SlotTaken,
    #[error("bay number {0} is already in use")]
    DuplicateBayNumber(u32),
    #[error("{0} already exists")]
    AlreadyExists(Ulid),
    #[error("appointment changed concurrently and is now {actual}")]
    ConcurrentUpdate { actual: AppointmentStatus },
    #[error("partial success: wrote {committed:?}, did not write {pending:?}: {cause}")]
    PartialSuccess {
        committed: Vec<Write>,
        pending: Vec<Write>,
        #[source]
        cause: Box<WorkflowError>,
    },
    /// Display never includes the store's own message.
    #[error("storage unavailable")]
    Storage(#[source] StoreError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        use WorkflowError::*;
        match self {
            NotFound { .. } => ErrorKind::NotFound,
            InvalidInput(_) => ErrorKind::InvalidInput,
            InvalidStatus(_) => ErrorKind::InvalidStatus,
            IllegalTransition(_) | AppointmentNotConfirmed { .. } | InconsistentBayState(_) => {
                ErrorKind::IllegalTransition
            }
            Forbidden(_) => ErrorKind::Forbidden,
            AppointmentAlreadySeated { .. }
            | BayOccupied { .. }
            | BayUnavailable { .. }
            | SlotTaken
            | DuplicateBayNumber(_)
            | AlreadyExists(_)
            | ConcurrentUpdate { .. } => ErrorKind::Conflict,
            PartialSuccess { .. } => ErrorKind::PartialSuccess,
            Storage(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        use WorkflowError::*;
        match self {
            NotFound { .. } => "not_found",
            InvalidInput(_) => "invalid_input",
            InvalidStatus(_) => "invalid_status",
            IllegalTransition(_) => "illegal_transition",
            Forbidden(_) => "forbidden",
            AppointmentNotConfirmed { .. } => "appointment_not_confirmed",
            AppointmentAlreadySeated { .. } => "appointment_already_seated",
            InconsistentBayState(_) => "inconsistent_bay_state",
            BayOccupied { .. } => "bay_occupied",
            BayUnavailable { .. } => "bay_unavailable",
            SlotTaken => "slot_taken",
            DuplicateBayNumber(_) => "duplicate_bay_number",
            AlreadyExists(_) => "already_exists",
            ConcurrentUpdate { .. } => "concurrent_update",
            PartialSuccess { .. } => "partial_success",
            Storage(_) => "storage_unavailable",
        }
    }

    pub(crate) fn partial(committed: &[Write], pending: &[Write], cause: WorkflowError) -> Self {
        WorkflowError::PartialSuccess {
            committed: committed.to_vec(),
            pending: pending.to_vec(),
            cause: Box::new(cause),
        }
    }
}

/// Generic mapping; services translate bay-specific variants themselves
/// because they know the bay number.
impl From<StoreError> for WorkflowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => WorkflowError::NotFound {
                entity: "document",
                id,
            },
            StoreError::AlreadyExists(id) => WorkflowError::AlreadyExists(id),
            StoreError::DuplicateBayNumber { number, .. } => WorkflowError::DuplicateBayNumber(number),
            StoreError::SlotTaken { .. } => WorkflowError::SlotTaken,
            StoreError::StatusMismatch { actual, .. } => WorkflowError::ConcurrentUpdate { actual },
            StoreError::LimitExceeded(what) => WorkflowError::InvalidInput(what.to_string()),
            other @ (StoreError::OccupantTaken { .. }
            | StoreError::BayNotAvailable { .. }
            | StoreError::BayOccupied { .. }
            | StoreError::Wal(_)) => WorkflowError::Storage(other),
        }
    }
}
