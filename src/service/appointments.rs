use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};
use ulid::Ulid;

use crate::lifecycle;
use crate::limits::{MAX_CUSTOMER_FIELD_LEN, MAX_NOTE_LEN, MAX_SEARCH_LEN, MAX_TIME_SLOT_LEN};
use crate::model::*;
use crate::store::{AppointmentStore, NotificationSink};

use super::{WorkflowError, check_len, check_opt_len, paginate};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppointmentFilter {
    pub status: Option<AppointmentStatus>,
    /// Inclusive.
    pub date_from: Option<NaiveDate>,
    /// Inclusive.
    pub date_to: Option<NaiveDate>,
    /// Substring over customer name, email and phone.
    pub customer: Option<String>,
}

impl AppointmentFilter {
    fn accepts(&self, appt: &Appointment) -> bool {
        self.status.is_none_or(|s| appt.status == s)
            && self.date_from.is_none_or(|d| appt.scheduled_date >= d)
            && self.date_to.is_none_or(|d| appt.scheduled_date <= d)
            && self
                .customer
                .as_deref()
                .is_none_or(|needle| appt.customer.matches(needle))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAppointment {
    pub id: Option<Ulid>,
    pub kind: AppointmentKind,
    pub subject_id: Ulid,
    pub scheduled_date: NaiveDate,
    pub time_slot: Option<String>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
}

/// Reads and status changes for appointments, scoped by the actor's desk.
#[derive(Clone)]
pub struct AppointmentService {
    store: Arc<dyn AppointmentStore>,
    notifications: Arc<dyn NotificationSink>,
}

impl AppointmentService {
    pub fn new(store: Arc<dyn AppointmentStore>, notifications: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            notifications,
        }
    }

    /// Customer booking. Always starts `pending`.
    pub async fn book(&self, actor: &Actor, new: NewAppointment) -> Result<Appointment, WorkflowError> {
        let Some(account_id) = actor.account_id() else {
            return Err(WorkflowError::Forbidden(
                "only a customer account can book appointments".into(),
            ));
        };

        let name = new.customer_name.trim();
        let email = new.customer_email.trim();
        if name.is_empty() {
            return Err(WorkflowError::InvalidInput("customer_name is required".into()));
        }
        if !email.contains('@') {
            return Err(WorkflowError::InvalidInput("customer_email is not an address".into()));
        }
        check_len("customer_name", name, MAX_CUSTOMER_FIELD_LEN)?;
        check_len("customer_email", email, MAX_CUSTOMER_FIELD_LEN)?;
        check_opt_len("customer_phone", new.customer_phone.as_deref(), MAX_CUSTOMER_FIELD_LEN)?;

        let time_slot = new
            .time_slot
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        match (new.kind, &time_slot) {
            (AppointmentKind::Service, None) => {
                return Err(WorkflowError::InvalidInput(
                    "service appointments need a time_slot".into(),
                ));
            }
            (AppointmentKind::TestDrive, Some(_)) => {
                return Err(WorkflowError::InvalidInput(
                    "test drives are booked by date only".into(),
                ));
            }
            _ => {}
        }
        check_opt_len("time_slot", time_slot.as_deref(), MAX_TIME_SLOT_LEN)?;

        let now = now_ms();
        let appointment = Appointment {
            id: new.id.unwrap_or_else(Ulid::new),
            kind: new.kind,
            customer: CustomerRef {
                account_id,
                name: name.to_string(),
                email: email.to_string(),
                phone: new.customer_phone,
            },
            subject_id: new.subject_id,
            scheduled_date: new.scheduled_date,
            time_slot,
            status: AppointmentStatus::Pending,
            note: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_appointment(appointment.clone()).await?;
        info!(
            "booked {} appointment {} for {}",
            appointment.kind, appointment.id, appointment.scheduled_date
        );
        Ok(appointment)
    }

    /// Staff see their desk's appointments, customers see their own.
    /// Sorted by scheduled date ascending.
    pub async fn list(
        &self,
        actor: &Actor,
        filter: &AppointmentFilter,
        page: PageRequest,
    ) -> Result<Page<Appointment>, WorkflowError> {
        if let Some(needle) = &filter.customer {
            check_len("customer search", needle, MAX_SEARCH_LEN)?;
        }
        let scope = Scope::of(actor)?;
        let mut rows: Vec<Appointment> = self
            .store
            .list_appointments()
            .await
            .into_iter()
            .filter(|a| scope.covers(a) && filter.accepts(a))
            .collect();
        rows.sort_by(|a, b| {
            a.scheduled_date
                .cmp(&b.scheduled_date)
                .then_with(|| a.time_slot.cmp(&b.time_slot))
                .then(a.id.cmp(&b.id))
        });
        paginate(rows, page)
    }

    pub async fn get(&self, actor: &Actor, id: Ulid) -> Result<Appointment, WorkflowError> {
        let scope = Scope::of(actor)?;
        let appt = self.find(id).await?;
        scope.check(&appt)?;
        Ok(appt)
    }

    /// Staff status change. `status` is the wire name.
    pub async fn set_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: &str,
        note: Option<String>,
    ) -> Result<Appointment, WorkflowError> {
        let scope = Scope::of(actor)?;
        if matches!(scope, Scope::Account(_)) {
            return Err(WorkflowError::Forbidden(
                "customers cannot change appointment status".into(),
            ));
        }
        let next: AppointmentStatus = status.parse()?;
        check_opt_len("note", note.as_deref(), MAX_NOTE_LEN)?;
        let current = self.find(id).await?;
        scope.check(&current)?;
        self.transition(&current, next, note).await
    }

    pub(crate) async fn find(&self, id: Ulid) -> Result<Appointment, WorkflowError> {
        self.store
            .get_appointment(id)
            .await
            .ok_or(WorkflowError::NotFound {
                entity: "appointment",
                id,
            })
    }

    /// Move `current` along one edge of the lifecycle and emit the
    /// customer notification that edge calls for.
    pub(crate) async fn transition(
        &self,
        current: &Appointment,
        next: AppointmentStatus,
        note: Option<String>,
    ) -> Result<Appointment, WorkflowError> {
        lifecycle::apply(current.status, next)?;
        let reason = note.clone();
        let updated = self
            .store
            .compare_and_set_status(current.id, current.status, next, note)
            .await?;
        metrics::counter!(crate::observability::APPOINTMENT_TRANSITIONS_TOTAL, "to" => next.as_str())
            .increment(1);
        info!("appointment {} {} -> {}", current.id, current.status, next);
        self.notify_customer(&updated, reason.as_deref()).await;
        Ok(updated)
    }

    /// Completion-cascade write. Forces `completed` from any live status;
    /// already completed is returned unchanged.
    pub(crate) async fn complete(&self, id: Ulid) -> Result<Appointment, WorkflowError> {
        let current = self.find(id).await?;
        match lifecycle::completion_target(current.status)? {
            None => Ok(current),
            Some(target) => {
                let updated = self
                    .store
                    .compare_and_set_status(id, current.status, target, None)
                    .await?;
                metrics::counter!(crate::observability::APPOINTMENT_TRANSITIONS_TOTAL, "to" => target.as_str())
                    .increment(1);
                info!("appointment {id} {} -> {target} (repair completed)", current.status);
                Ok(updated)
            }
        }
    }

    pub(crate) async fn all(&self) -> Vec<Appointment> {
        self.store.list_appointments().await
    }

    /// Notifications are fire-and-forget: a failed push is logged and
    /// counted, never turned into an error for a status change that landed.
    /// `reason` is the note sent with this change, not the stored one.
    async fn notify_customer(&self, appt: &Appointment, reason: Option<&str>) {
        let message = match appt.status {
            AppointmentStatus::Confirmed => confirmed_message(appt),
            AppointmentStatus::Cancelled => cancelled_message(appt, reason),
            _ => return,
        };
        let notification = Notification::new(appt.customer.account_id, message);
        if let Err(e) = self.notifications.push_notification(notification).await {
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            warn!("notification for appointment {} not stored: {e}", appt.id);
        }
    }
}

fn describe(appt: &Appointment) -> String {
    let what = match appt.kind {
        AppointmentKind::Service => "service appointment",
        AppointmentKind::TestDrive => "test drive",
    };
    match &appt.time_slot {
        Some(slot) => format!("{what} on {} at {slot}", appt.scheduled_date),
        None => format!("{what} on {}", appt.scheduled_date),
    }
}

fn confirmed_message(appt: &Appointment) -> String {
    format!(
        "Hi {}, your {} is confirmed. See you then!",
        appt.customer.name,
        describe(appt)
    )
}

fn cancelled_message(appt: &Appointment, reason: Option<&str>) -> String {
    let mut message = format!("Your {} has been cancelled.", describe(appt));
    if let Some(reason) = reason.filter(|n| !n.trim().is_empty()) {
        message.push_str(" Reason: ");
        message.push_str(reason);
    }
    message
}

/// Which appointments an actor may see.
enum Scope {
    Desk(AppointmentKind),
    Account(Ulid),
}

impl Scope {
    fn of(actor: &Actor) -> Result<Self, WorkflowError> {
        if let Some(kind) = actor.role.staff_domain() {
            return Ok(Scope::Desk(kind));
        }
        actor
            .account_id()
            .map(Scope::Account)
            .ok_or_else(|| WorkflowError::Forbidden("customer identity is not an account id".into()))
    }

    fn covers(&self, appt: &Appointment) -> bool {
        match self {
            Scope::Desk(kind) => appt.kind == *kind,
            Scope::Account(account) => appt.customer.account_id == *account,
        }
    }

    fn check(&self, appt: &Appointment) -> Result<(), WorkflowError> {
        if self.covers(appt) {
            Ok(())
        } else {
            Err(WorkflowError::Forbidden(format!(
                "appointment {} is outside your desk",
                appt.id
            )))
        }
    }
}
