//! 持久化抽象
//!
//! 协调器只依赖这里的接口；具体存储（内存、SQLite）在 infrastructure 中实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{AckResult, ClaimRecord, ClaimStatus, DeadLetterEntry, Message, MessageStats, TaskRef};
use coordinator_core::CoordinatorResult;

/// 出站消息的追加式存储
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn initialize(&self) -> CoordinatorResult<()>;
    async fn close(&self) -> CoordinatorResult<()>;
    /// 追加写入；同一id重复写入是错误
    async fn append(&self, message: &Message) -> CoordinatorResult<()>;
    async fn get(&self, message_id: &str) -> CoordinatorResult<Option<Message>>;
    /// 幂等确认；只有消息的 recipient 可以确认
    async fn acknowledge(&self, message_id: &str, recipient_id: &str)
        -> CoordinatorResult<AckResult>;
    async fn stats(&self) -> CoordinatorResult<MessageStats>;
}

/// 死信存储
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn store(&self, entry: &DeadLetterEntry) -> CoordinatorResult<()>;
    async fn get(&self, id: &str) -> CoordinatorResult<Option<DeadLetterEntry>>;
    /// 返回 next_retry_at <= now 的条目，按 next_retry_at 升序
    async fn get_due(&self, now: DateTime<Utc>) -> CoordinatorResult<Vec<DeadLetterEntry>>;
    async fn update_retry_count(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> CoordinatorResult<bool>;
    async fn remove(&self, id: &str) -> CoordinatorResult<bool>;
    async fn list(&self) -> CoordinatorResult<Vec<DeadLetterEntry>>;
    async fn count(&self) -> CoordinatorResult<u64>;
}

/// 任务认领存储
///
/// 一条记录同时表示待认领任务和它的认领状态。所有状态转换都是条件更新，
/// 并发调用中最多一个成功；调用方不需要额外加锁。
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// 加入待认领队列尾部。任务已在队列中或处于 claimed 时返回 false；
    /// 已结束的任务被重置为待认领。
    async fn enqueue(&self, task: &TaskRef) -> CoordinatorResult<bool>;
    /// 待认领任务，按队列顺序
    async fn pending(&self) -> CoordinatorResult<Vec<TaskRef>>;
    async fn find_pending(&self, task_id: &str) -> CoordinatorResult<Option<TaskRef>>;
    /// 从未被认领过的任务没有认领记录
    async fn get(&self, task_id: &str) -> CoordinatorResult<Option<ClaimRecord>>;
    /// 比较并设置：任务不存在、待认领或已放弃时创建 claimed 记录
    async fn try_claim(
        &self,
        task: &TaskRef,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool>;
    /// 只有 `worker_id` 持有的 claimed 记录能转为 `status`
    async fn release(
        &self,
        task_id: &str,
        worker_id: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool>;
    /// 撤销一次 release：`worker_id` 的 `status` 记录回到 claimed
    async fn reopen(
        &self,
        task_id: &str,
        worker_id: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool>;
    /// `worker_id` 持有的 claimed 记录转为 abandoned，任务回到队首
    async fn abandon(
        &self,
        task_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool>;
    /// claimed 记录，按 claimed_at 升序
    async fn active_claims(&self) -> CoordinatorResult<Vec<ClaimRecord>>;
    async fn pending_count(&self) -> CoordinatorResult<u64>;
}
