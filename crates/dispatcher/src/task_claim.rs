//! 任务认领
//!
//! 同一 task_id 在任意时刻最多只有一条 `claimed` 记录。互斥由 [`ClaimStore`]
//! 的条件更新保证，这里不持有任何跨越 `.await` 的锁。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use coordinator_core::{CoordinatorError, CoordinatorResult};
use coordinator_domain::{
    ClaimRecord, ClaimRequest, ClaimStatus, ClaimStore, Message, TaskRef, WorkerInfo,
    WorkerStatus,
};

use crate::worker_registry::WorkerRegistry;

pub const REASON_WORKER_NOT_ACTIVE: &str = "worker_not_active";
pub const REASON_WORKER_STALE: &str = "worker_stale";
pub const REASON_ALREADY_CLAIMED: &str = "already_claimed";
pub const REASON_NO_TASKS_AVAILABLE: &str = "no_tasks_available";
pub const REASON_TASK_FINISHED: &str = "task_finished";
pub const REASON_CAPABILITY_MISMATCH: &str = "capability_mismatch";

/// 认领结果
///
/// `max_tasks > 1` 时按尽力而为处理：每个任务独立认领，
/// 认领数量少于请求数量时 `partial` 为 true。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimResult {
    pub success: bool,
    pub task_id: Option<String>,
    pub task_ids: Vec<String>,
    pub tasks: Vec<TaskRef>,
    pub partial: bool,
    pub reason: Option<String>,
    pub trace_id: Option<String>,
}

impl ClaimResult {
    fn granted(tasks: Vec<TaskRef>, requested: usize) -> Self {
        let task_ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
        Self {
            success: true,
            task_id: task_ids.first().cloned(),
            partial: task_ids.len() < requested,
            task_ids,
            tasks,
            reason: None,
            trace_id: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

fn owner_inactive(statuses: &HashMap<String, WorkerStatus>, worker_id: &str) -> bool {
    matches!(
        statuses.get(worker_id),
        Some(WorkerStatus::Stale | WorkerStatus::Offline)
    )
}

type Attempt<T> = Result<T, &'static str>;

pub struct TaskClaim {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn ClaimStore>,
}

impl TaskClaim {
    pub fn new(registry: Arc<WorkerRegistry>, store: Arc<dyn ClaimStore>) -> Self {
        Self { registry, store }
    }

    /// 提交待认领任务
    pub async fn submit(&self, task: TaskRef) -> CoordinatorResult<()> {
        if task.task_id.trim().is_empty() {
            return Err(CoordinatorError::validation_error("task_id 不能为空"));
        }
        if task.capability.trim().is_empty() {
            return Err(CoordinatorError::validation_error("capability 不能为空"));
        }

        // 已结束的任务可以重新提交
        if !self.store.enqueue(&task).await? {
            let message = match self.store.get(&task.task_id).await?.map(|r| r.status) {
                Some(ClaimStatus::Claimed) => format!("任务已被认领: {}", task.task_id),
                _ => format!("任务已在待认领队列中: {}", task.task_id),
            };
            return Err(CoordinatorError::validation_error(message));
        }

        debug!(task_id = %task.task_id, capability = %task.capability, "任务已提交");
        Ok(())
    }

    /// 处理 CLAIM_TASK 消息
    pub async fn claim(&self, message: &Message) -> CoordinatorResult<ClaimResult> {
        let request = ClaimRequest::from_message(message)?;

        let Some(worker) = self.registry.get(&request.worker_id).await else {
            debug!(worker_id = %request.worker_id, "未注册的Worker尝试认领任务");
            return Ok(ClaimResult::rejected(REASON_WORKER_NOT_ACTIVE));
        };
        match worker.status {
            WorkerStatus::Active => {}
            WorkerStatus::Stale => {
                debug!(worker_id = %worker.id, "STALE Worker尝试认领任务");
                return Ok(ClaimResult::rejected(REASON_WORKER_STALE));
            }
            WorkerStatus::Offline => {
                debug!(worker_id = %worker.id, "OFFLINE Worker尝试认领任务");
                return Ok(ClaimResult::rejected(REASON_WORKER_NOT_ACTIVE));
            }
        }

        let abandoned = self.abandon_inactive().await?;
        if abandoned > 0 {
            info!(count = abandoned, "回收了属于非活跃Worker的认领");
        }

        let requested = request.max_tasks.max(1) as usize;
        let capability = request.capability.as_deref();
        let now = Utc::now();

        let outcome = match request.task_id.as_deref() {
            Some(task_id) => self
                .claim_specific(task_id, &worker, capability, now)
                .await?
                .map(|task| (vec![task], 1)),
            None => {
                let tasks = self.claim_next(&worker, capability, requested, now).await?;
                if tasks.is_empty() {
                    Err(REASON_NO_TASKS_AVAILABLE)
                } else {
                    Ok((tasks, requested))
                }
            }
        };

        match outcome {
            Ok((tasks, requested)) => {
                let result = ClaimResult::granted(tasks, requested);
                info!(
                    worker_id = %worker.id,
                    task_ids = ?result.task_ids,
                    partial = result.partial,
                    "任务认领成功"
                );
                Ok(result)
            }
            Err(reason) => {
                debug!(worker_id = %worker.id, reason, "任务认领被拒绝");
                Ok(ClaimResult::rejected(reason))
            }
        }
    }

    async fn abandon_inactive(&self) -> CoordinatorResult<usize> {
        let cutoff = Utc::now().timestamp_millis();
        let statuses = self.registry.status_snapshot().await;
        self.abandon_claims_of(&statuses, cutoff).await
    }

    /// 放弃快照中处于 STALE/OFFLINE 的Worker持有的认领
    ///
    /// 只处理 `cutoff`（毫秒）之前创建的认领：之后的认领可能来自快照后
    /// 才注册或恢复的Worker。快照中没有的Worker不会被当作非活跃。
    async fn abandon_claims_of(
        &self,
        statuses: &HashMap<String, WorkerStatus>,
        cutoff: i64,
    ) -> CoordinatorResult<usize> {
        let mut stale: Vec<ClaimRecord> = self
            .store
            .active_claims()
            .await?
            .into_iter()
            .filter(|r| {
                r.claimed_at.timestamp_millis() < cutoff && owner_inactive(statuses, &r.worker_id)
            })
            .collect();
        // 逐个放到队首，最早提交的任务最后放入
        stale.sort_by(|a, b| b.task.submitted_at.cmp(&a.task.submitted_at));

        let now = Utc::now();
        let mut count = 0;
        for record in stale {
            if self.store.abandon(record.task_id(), &record.worker_id, now).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn claim_specific(
        &self,
        task_id: &str,
        worker: &WorkerInfo,
        capability: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<Attempt<TaskRef>> {
        if let Some(existing) = self.store.get(task_id).await? {
            match existing.status {
                ClaimStatus::Claimed => return Ok(Err(REASON_ALREADY_CLAIMED)),
                ClaimStatus::Completed | ClaimStatus::Failed => return Ok(Err(REASON_TASK_FINISHED)),
                ClaimStatus::Abandoned => {}
            }
        }

        // 不在待认领队列中的任务也可以按id认领
        let task = match self.store.find_pending(task_id).await? {
            Some(queued) => {
                if !queued.capability.is_empty() && !worker.has_capability(&queued.capability) {
                    return Ok(Err(REASON_CAPABILITY_MISMATCH));
                }
                queued
            }
            None => TaskRef::new(task_id, capability.unwrap_or_default()),
        };

        if self.store.try_claim(&task, &worker.id, now).await? {
            return Ok(Ok(task));
        }
        // 比较并设置失败：其他认领抢先一步
        let reason = match self.store.get(task_id).await?.map(|r| r.status) {
            Some(status) if status.is_final() => REASON_TASK_FINISHED,
            _ => REASON_ALREADY_CLAIMED,
        };
        Ok(Err(reason))
    }

    async fn claim_next(
        &self,
        worker: &WorkerInfo,
        capability: Option<&str>,
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<Vec<TaskRef>> {
        let mut taken = Vec::new();
        for candidate in self.store.pending().await? {
            if taken.len() >= max_tasks {
                break;
            }
            let eligible = worker.has_capability(&candidate.capability)
                && capability.is_none_or(|c| c == candidate.capability);
            if eligible && self.store.try_claim(&candidate, &worker.id, now).await? {
                taken.push(candidate);
            }
        }
        Ok(taken)
    }

    /// 结束认领，返回是否真正释放
    ///
    /// 认领不属于该Worker（已被回收或重复完成）时只记录日志并返回 false。
    pub async fn release(
        &self,
        task_id: &str,
        worker_id: &str,
        final_status: ClaimStatus,
    ) -> CoordinatorResult<bool> {
        if !final_status.is_final() {
            return Err(CoordinatorError::validation_error(format!(
                "释放认领的最终状态只能是 completed 或 failed: {final_status:?}"
            )));
        }

        if self
            .store
            .release(task_id, worker_id, final_status, Utc::now())
            .await?
        {
            debug!(task_id, worker_id, status = ?final_status, "认领已释放");
            return Ok(true);
        }

        match self.store.get(task_id).await? {
            None => warn!(task_id, worker_id, "释放未知的认领，忽略"),
            Some(record) if record.worker_id != worker_id => warn!(
                task_id,
                worker_id,
                owner = %record.worker_id,
                "认领属于其他Worker，忽略过期的释放"
            ),
            Some(record) => {
                debug!(task_id, worker_id, status = ?record.status, "认领已结束，忽略重复释放")
            }
        }
        Ok(false)
    }

    /// 撤销一次释放，认领回到 claimed
    pub async fn restore(
        &self,
        task_id: &str,
        worker_id: &str,
        released_as: ClaimStatus,
    ) -> CoordinatorResult<bool> {
        let restored = self
            .store
            .reopen(task_id, worker_id, released_as, Utc::now())
            .await?;
        if restored {
            debug!(task_id, worker_id, "认领已恢复为claimed");
        }
        Ok(restored)
    }

    /// 指定Worker仍处于 claimed 状态的任务
    pub async fn get_abandoned_tasks(&self, worker_id: &str) -> CoordinatorResult<Vec<TaskRef>> {
        Ok(self
            .store
            .active_claims()
            .await?
            .into_iter()
            .filter(|r| r.worker_id == worker_id)
            .map(|r| r.task)
            .collect())
    }

    /// 把认领标记为放弃，任务回到待认领队列的队首
    pub async fn mark_for_reassignment(&self, task_id: &str) -> CoordinatorResult<bool> {
        let owner = match self.store.get(task_id).await? {
            Some(record) if record.is_claimed() => record.worker_id,
            _ => {
                debug!(task_id, "任务没有有效认领，无需重新分配");
                return Ok(false);
            }
        };

        // 只放弃读取时的持有者，期间被重新认领的记录不受影响
        if !self.store.abandon(task_id, &owner, Utc::now()).await? {
            debug!(task_id, "认领已变化，跳过重新分配");
            return Ok(false);
        }
        info!(task_id, "任务已标记为待重新分配");
        Ok(true)
    }

    pub async fn get_claim(&self, task_id: &str) -> CoordinatorResult<Option<ClaimRecord>> {
        self.store.get(task_id).await
    }

    pub async fn active_claims(&self) -> CoordinatorResult<Vec<ClaimRecord>> {
        self.store.active_claims().await
    }

    pub async fn active_claim_count(&self) -> CoordinatorResult<usize> {
        Ok(self.store.active_claims().await?.len())
    }

    pub async fn pending_tasks(&self) -> CoordinatorResult<Vec<TaskRef>> {
        self.store.pending().await
    }

    pub async fn pending_count(&self) -> CoordinatorResult<usize> {
        Ok(self.store.pending_count().await? as usize)
    }
}
