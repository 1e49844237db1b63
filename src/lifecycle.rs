//! The one transition table for appointment status.
//!
//! ```text
//! pending     -> confirmed, cancelled
//! confirmed   -> in_progress, cancelled
//! in_progress -> completed
//! completed   -> (none)
//! cancelled   -> (none)
//! ```
//!
//! Every service that moves an appointment consults this module; none of
//! them re-derive the edges.

use crate::model::AppointmentStatus::{self, *};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: AppointmentStatus,
    pub to: AppointmentStatus,
}

pub fn successors(current: AppointmentStatus) -> &'static [AppointmentStatus] {
    match current {
        Pending => &[Confirmed, Cancelled],
        Confirmed => &[InProgress, Cancelled],
        InProgress => &[Completed],
        Completed | Cancelled => &[],
    }
}

pub fn can_transition(current: AppointmentStatus, next: AppointmentStatus) -> bool {
    successors(current).contains(&next)
}

pub fn is_terminal(status: AppointmentStatus) -> bool {
    successors(status).is_empty()
}

/// Validate `current -> next`, returning the new status.
pub fn apply(
    current: AppointmentStatus,
    next: AppointmentStatus,
) -> Result<AppointmentStatus, IllegalTransition> {
    if can_transition(current, next) {
        Ok(next)
    } else {
        Err(IllegalTransition {
            from: current,
            to: next,
        })
    }
}

/// Target of the repair-completion cascade.
///
/// Completion is forced from any live status (work may be logged without
/// seating), is a no-op when already completed (`Ok(None)`), and never
/// resurrects a cancelled appointment.
pub fn completion_target(
    current: AppointmentStatus,
) -> Result<Option<AppointmentStatus>, IllegalTransition> {
    match current {
        Pending | Confirmed | InProgress => Ok(Some(Completed)),
        Completed => Ok(None),
        Cancelled => Err(IllegalTransition {
            from: Cancelled,
            to: Completed,
        }),
    }
}

/// Whether the slot held by an appointment in this status is still taken.
pub fn holds_slot(status: AppointmentStatus) -> bool {
    status != Cancelled
}
