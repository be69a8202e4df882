use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use coordinator_core::CoordinatorResult;
use coordinator_domain::{DeadLetterEntry, DeadLetterStore};

/// 内存死信存储
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<HashMap<String, DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_by_due(entries: &mut [DeadLetterEntry]) {
    entries.sort_by(|a, b| {
        a.next_retry_at
            .cmp(&b.next_retry_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn store(&self, entry: &DeadLetterEntry) -> CoordinatorResult<()> {
        self.entries
            .write()
            .await
            .insert(entry.id.clone(), entry.clone());
        debug!(entry_id = %entry.id, reason = %entry.reason, "死信已写入内存存储");
        Ok(())
    }

    async fn get(&self, id: &str) -> CoordinatorResult<Option<DeadLetterEntry>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn get_due(&self, now: DateTime<Utc>) -> CoordinatorResult<Vec<DeadLetterEntry>> {
        let mut due: Vec<DeadLetterEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.next_retry_at <= now)
            .cloned()
            .collect();
        sort_by_due(&mut due);
        Ok(due)
    }

    async fn update_retry_count(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(entry) => {
                entry.retry_count = retry_count;
                entry.next_retry_at = next_retry_at;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, id: &str) -> CoordinatorResult<bool> {
        Ok(self.entries.write().await.remove(id).is_some())
    }

    async fn list(&self) -> CoordinatorResult<Vec<DeadLetterEntry>> {
        let mut all: Vec<DeadLetterEntry> = self.entries.read().await.values().cloned().collect();
        sort_by_due(&mut all);
        Ok(all)
    }

    async fn count(&self) -> CoordinatorResult<u64> {
        Ok(self.entries.read().await.len() as u64)
    }
}
