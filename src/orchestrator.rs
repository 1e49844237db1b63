use std::sync::Arc;

use crate::service::{AppointmentService, BayAssignmentService, NotificationInbox, RepairProgressService};
use crate::store::{AppointmentStore, BayStore, NotificationSink, ProgressStore, Store};

/// Composition root handed to the wire layer and the background tasks.
/// Holds the services and nothing else.
#[derive(Clone)]
pub struct Workflow {
    pub appointments: AppointmentService,
    pub bays: BayAssignmentService,
    pub progress: RepairProgressService,
    pub inbox: NotificationInbox,
}

impl Workflow {
    pub fn new(
        appointment_store: Arc<dyn AppointmentStore>,
        bay_store: Arc<dyn BayStore>,
        progress_store: Arc<dyn ProgressStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let appointments = AppointmentService::new(appointment_store, notifications.clone());
        let bays = BayAssignmentService::new(bay_store, appointments.clone());
        let progress = RepairProgressService::new(progress_store, bays.clone());
        Self {
            appointments,
            bays,
            progress,
            inbox: NotificationInbox::new(notifications),
        }
    }

    /// Wire every service to the one document store.
    pub fn over(store: Arc<Store>) -> Self {
        Self::new(store.clone(), store.clone(), store.clone(), store)
    }
}
