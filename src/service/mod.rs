//! Workflow services over the leaf stores.
//!
//! Every public operation takes the acting identity explicitly and runs
//! all validation before its first write. Multi-document operations write
//! in a fixed order; a failure after the first write comes back as
//! `WorkflowError::PartialSuccess`.

mod appointments;
mod bays;
mod error;
mod notifications;
mod progress;

pub use appointments::{AppointmentFilter, AppointmentService, NewAppointment};
pub use bays::{BayAssignmentService, BayFilter, BayUpdate, NewBay};
pub use error::{ErrorKind, WorkflowError, Write};
pub use notifications::NotificationInbox;
pub use progress::{NewProgress, ProgressFilter, ProgressUpdate, RepairProgressService};

use crate::limits::MAX_PAGE_SIZE;
use crate::model::{Actor, Page, PageRequest, Role};

/// Slice one page out of an already filtered and sorted list.
pub(crate) fn paginate<T>(items: Vec<T>, page: PageRequest) -> Result<Page<T>, WorkflowError> {
    if page.page == 0 {
        return Err(WorkflowError::InvalidInput("page starts at 1".into()));
    }
    if page.page_size == 0 || page.page_size > MAX_PAGE_SIZE {
        return Err(WorkflowError::InvalidInput(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let total = items.len();
    let skip = (page.page as usize - 1).saturating_mul(page.page_size as usize);
    let items = items
        .into_iter()
        .skip(skip)
        .take(page.page_size as usize)
        .collect();
    Ok(Page { items, total })
}

pub(crate) fn require_role(actor: &Actor, role: Role) -> Result<(), WorkflowError> {
    if actor.role == role {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden(format!(
            "{} role required, connected as {}",
            role, actor.role
        )))
    }
}

pub(crate) fn check_len(field: &str, value: &str, max: usize) -> Result<(), WorkflowError> {
    if value.chars().count() > max {
        return Err(WorkflowError::InvalidInput(format!(
            "{field} is longer than {max} characters"
        )));
    }
    Ok(())
}

pub(crate) fn check_opt_len(field: &str, value: Option<&str>, max: usize) -> Result<(), WorkflowError> {
    match value {
        Some(v) => check_len(field, v, max),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests;
