use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{NotificationSink, Store, StoreError};

#[async_trait]
impl NotificationSink for Store {
    async fn push_notification(&self, notification: Notification) -> Result<(), StoreError> {
        let _gate = self.write_gate().await;
        self.persist(Event::NotificationSaved(notification.clone()))
            .await?;
        self.notifications
            .insert(notification.id, Arc::new(RwLock::new(notification)));
        Ok(())
    }

    async fn get_notification(&self, id: Ulid) -> Option<Notification> {
        Self::read_doc(&self.notifications, &id).await
    }

    async fn notifications_for(&self, recipient: Ulid) -> Vec<Notification> {
        let mut mine: Vec<Notification> = Self::snapshot(&self.notifications)
            .await
            .into_iter()
            .filter(|n| n.recipient == recipient)
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        mine
    }

    async fn mark_notification_read(&self, id: Ulid) -> Result<Notification, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = Self::lock_doc(&self.notifications, id).await?;
        if guard.read {
            return Ok(guard.clone());
        }
        let mut updated = guard.clone();
        updated.read = true;
        self.persist(Event::NotificationSaved(updated.clone())).await?;
        *guard = updated.clone();
        Ok(updated)
    }
}
