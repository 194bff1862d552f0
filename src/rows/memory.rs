use super::{Applied, RowError, RowRecord, RowStatus, RowStore, StoreError, Transition, apply};
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

type Slot = Arc<Mutex<Option<RowRecord>>>;

/// Process-local rows. Each row has its own lock; the outer map lock is only
/// held long enough to find or create a slot.
#[derive(Clone, Default)]
pub struct InMemoryRowStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, row_key: &str) -> Slot {
        self.slots
            .lock()
            .await
            .entry(row_key.to_string())
            .or_default()
            .clone()
    }

    async fn existing_slot(&self, row_key: &str) -> Option<Slot> {
        self.slots.lock().await.get(row_key).cloned()
    }

    #[cfg(test)]
    async fn hold(&self, row_key: &str) -> tokio::sync::OwnedMutexGuard<Option<RowRecord>> {
        self.slot(row_key).await.lock_owned().await
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, row_key: &str) -> Result<Option<RowRecord>, StoreError> {
        match self.existing_slot(row_key).await {
            Some(slot) => Ok(slot.lock().await.clone()),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        row_key: &str,
        transition: Transition,
    ) -> Result<RowRecord, RowError> {
        let slot = self.slot(row_key).await;
        let mut guard = slot.lock().await;
        match apply(row_key, guard.as_ref(), &transition, Utc::now())? {
            Applied::Changed(record) => {
                debug!(
                    target = "research.rows",
                    row_key,
                    transition = transition.name(),
                    status = %record.status,
                    "row updated"
                );
                *guard = Some(record.clone());
                Ok(record)
            }
            Applied::Unchanged => guard
                .clone()
                .ok_or_else(|| StoreError::Corrupt(format!("row {row_key} vanished")).into()),
        }
    }

    async fn withdraw(&self, row_key: &str) -> Result<bool, StoreError> {
        let Some(slot) = self.existing_slot(row_key).await else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        if guard.as_ref().map(|row| row.status) != Some(RowStatus::Pending) {
            return Ok(false);
        }
        *guard = None;
        debug!(target = "research.rows", row_key, "pending row withdrawn");
        Ok(true)
    }
}
