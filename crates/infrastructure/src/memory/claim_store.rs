use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use coordinator_core::CoordinatorResult;
use coordinator_domain::{ClaimRecord, ClaimStatus, ClaimStore, TaskRef};

#[derive(Debug, Default)]
struct Ledger {
    /// 等待认领的任务；其中的任务一定没有 `claimed` 记录
    backlog: VecDeque<TaskRef>,
    claims: HashMap<String, ClaimRecord>,
}

impl Ledger {
    fn take_queued(&mut self, task_id: &str) -> Option<TaskRef> {
        let idx = self.backlog.iter().position(|t| t.task_id == task_id)?;
        self.backlog.remove(idx)
    }
}

/// 内存认领台账
///
/// 每个操作在一次加锁内完成比较和设置。
#[derive(Debug, Default)]
pub struct InMemoryClaimStore {
    ledger: Mutex<Ledger>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn enqueue(&self, task: &TaskRef) -> CoordinatorResult<bool> {
        let mut ledger = self.ledger.lock().await;
        if ledger.backlog.iter().any(|t| t.task_id == task.task_id) {
            return Ok(false);
        }
        match ledger.claims.get(&task.task_id).map(|r| r.status) {
            Some(ClaimStatus::Claimed) => return Ok(false),
            Some(_) => {
                ledger.claims.remove(&task.task_id);
            }
            None => {}
        }
        ledger.backlog.push_back(task.clone());
        Ok(true)
    }

    async fn pending(&self) -> CoordinatorResult<Vec<TaskRef>> {
        Ok(self.ledger.lock().await.backlog.iter().cloned().collect())
    }

    async fn find_pending(&self, task_id: &str) -> CoordinatorResult<Option<TaskRef>> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.backlog.iter().find(|t| t.task_id == task_id).cloned())
    }

    async fn get(&self, task_id: &str) -> CoordinatorResult<Option<ClaimRecord>> {
        Ok(self.ledger.lock().await.claims.get(task_id).cloned())
    }

    async fn try_claim(
        &self,
        task: &TaskRef,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let mut ledger = self.ledger.lock().await;
        if let Some(existing) = ledger.claims.get(&task.task_id) {
            if existing.status != ClaimStatus::Abandoned {
                return Ok(false);
            }
        }

        let task = ledger
            .take_queued(&task.task_id)
            .unwrap_or_else(|| task.clone());
        ledger.claims.insert(
            task.task_id.clone(),
            ClaimRecord {
                task,
                worker_id: worker_id.to_string(),
                claimed_at: now,
                status: ClaimStatus::Claimed,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn release(
        &self,
        task_id: &str,
        worker_id: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let mut ledger = self.ledger.lock().await;
        match ledger.claims.get_mut(task_id) {
            Some(record) if record.worker_id == worker_id && record.is_claimed() => {
                record.status = status;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reopen(
        &self,
        task_id: &str,
        worker_id: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let mut ledger = self.ledger.lock().await;
        match ledger.claims.get_mut(task_id) {
            Some(record) if record.worker_id == worker_id && record.status == status => {
                record.status = ClaimStatus::Claimed;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abandon(
        &self,
        task_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let mut ledger = self.ledger.lock().await;
        let task = match ledger.claims.get_mut(task_id) {
            Some(record) if record.worker_id == worker_id && record.is_claimed() => {
                record.status = ClaimStatus::Abandoned;
                record.updated_at = now;
                record.task.clone()
            }
            _ => return Ok(false),
        };

        ledger.backlog.push_front(task);
        debug!(task_id, worker_id, "认领已放弃，任务回到队首");
        Ok(true)
    }

    async fn active_claims(&self) -> CoordinatorResult<Vec<ClaimRecord>> {
        let ledger = self.ledger.lock().await;
        let mut active: Vec<ClaimRecord> = ledger
            .claims
            .values()
            .filter(|r| r.is_claimed())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at));
        Ok(active)
    }

    async fn pending_count(&self) -> CoordinatorResult<u64> {
        Ok(self.ledger.lock().await.backlog.len() as u64)
    }
}
