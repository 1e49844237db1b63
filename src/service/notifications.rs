use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;
use crate::store::NotificationSink;

use super::{WorkflowError, paginate};

/// Customer read side of the notification outbox.
#[derive(Clone)]
pub struct NotificationInbox {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationInbox {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Newest first.
    pub async fn list(&self, actor: &Actor, page: PageRequest) -> Result<Page<Notification>, WorkflowError> {
        let account = Self::account(actor)?;
        paginate(self.sink.notifications_for(account).await, page)
    }

    /// Only the recipient may mark a notification read. Idempotent.
    pub async fn mark_read(&self, actor: &Actor, id: Ulid) -> Result<Notification, WorkflowError> {
        let account = Self::account(actor)?;
        let notification = self
            .sink
            .get_notification(id)
            .await
            .ok_or(WorkflowError::NotFound {
                entity: "notification",
                id,
            })?;
        if notification.recipient != account {
            return Err(WorkflowError::Forbidden(format!(
                "notification {id} is not addressed to you"
            )));
        }
        Ok(self.sink.mark_notification_read(id).await?)
    }

    fn account(actor: &Actor) -> Result<Ulid, WorkflowError> {
        actor
            .account_id()
            .ok_or_else(|| WorkflowError::Forbidden("notifications are read by customer accounts".into()))
    }
}
