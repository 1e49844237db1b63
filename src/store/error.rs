use ulid::Ulid;

use crate::model::{AppointmentStatus, BayStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("bay number {number} already used by bay {existing}")]
    DuplicateBayNumber { number: u32, existing: Ulid },
    #[error("time slot already held by appointment {holder}")]
    SlotTaken { holder: Ulid },
    #[error("appointment status is {actual}, expected {expected}")]
    StatusMismatch {
        expected: AppointmentStatus,
        actual: AppointmentStatus,
    },
    #[error("appointment {appointment_id} is already seated at bay {bay_id}")]
    OccupantTaken { appointment_id: Ulid, bay_id: Ulid },
    #[error("bay {bay_id} is {status}")]
    BayNotAvailable {
        bay_id: Ulid,
        status: BayStatus,
        current_booking: Option<Ulid>,
    },
    #[error("bay {bay_id} is {status}")]
    BayOccupied { bay_id: Ulid, status: BayStatus },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}
