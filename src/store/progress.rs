use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{ProgressStore, Store, StoreError};

#[async_trait]
impl ProgressStore for Store {
    async fn get_progress(&self, id: Ulid) -> Option<RepairProgress> {
        Self::read_doc(&self.progress, &id).await
    }

    async fn list_progress(&self) -> Vec<RepairProgress> {
        Self::snapshot(&self.progress).await
    }

    async fn insert_progress(&self, progress: RepairProgress) -> Result<(), StoreError> {
        let _gate = self.write_gate().await;
        if self.progress.contains_key(&progress.id) {
            return Err(StoreError::AlreadyExists(progress.id));
        }
        self.persist(Event::ProgressSaved(progress.clone())).await?;
        self.progress
            .insert(progress.id, Arc::new(RwLock::new(progress)));
        Ok(())
    }

    async fn replace_progress(&self, progress: RepairProgress) -> Result<(), StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = Self::lock_doc(&self.progress, progress.id).await?;
        self.persist(Event::ProgressSaved(progress.clone())).await?;
        *guard = progress;
        Ok(())
    }

    async fn remove_progress(&self, id: Ulid) -> Result<RepairProgress, StoreError> {
        let _gate = self.write_gate().await;
        let guard = Self::lock_doc(&self.progress, id).await?;
        self.persist(Event::ProgressDeleted { id }).await?;
        let removed = guard.clone();
        self.progress.remove(&id);
        Ok(removed)
    }
}
