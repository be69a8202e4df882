use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use coordinator_core::{CoordinatorConfig, CoordinatorError, CoordinatorResult};
use coordinator_domain::{DeadLetterEntry, DeadLetterStore, Message};

pub const REASON_MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";

/// 死信重试的指数退避
///
/// `delay = min(base * multiplier^(retry_count - max_attempts), max_delay)`，
/// 指数下限为0，因此延迟随 retry_count 单调不减。
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.dead_letter_base_delay_ms),
            max_delay: Duration::from_millis(config.dead_letter_max_delay_ms),
            multiplier: config.dead_letter_backoff_multiplier,
            max_attempts: config.retry_max_attempts,
        }
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(self.max_attempts).min(64) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }
}

/// 死信队列
pub struct DeadLetter {
    store: Arc<dyn DeadLetterStore>,
    policy: BackoffPolicy,
}

impl DeadLetter {
    pub fn new(store: Arc<dyn DeadLetterStore>, policy: BackoffPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    fn next_retry_at(&self, retry_count: u32) -> chrono::DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.policy.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX / 1_000_000));
        Utc::now() + delay
    }

    /// 存入死信；只接受重试次数已达上限的消息
    pub async fn store(&self, message: &Message, reason: &str) -> CoordinatorResult<DeadLetterEntry> {
        let retry_count = message.retry_count();
        if retry_count < self.policy.max_attempts {
            return Err(CoordinatorError::validation_error(format!(
                "消息重试次数 {retry_count} 未达到上限 {}，不能进入死信",
                self.policy.max_attempts
            )));
        }

        let now = Utc::now();
        let entry = DeadLetterEntry {
            id: Uuid::new_v4().to_string(),
            message: message.clone(),
            reason: reason.to_string(),
            retry_count,
            next_retry_at: self.next_retry_at(retry_count),
            created_at: now,
            updated_at: now,
        };
        self.store.store(&entry).await?;

        warn!(
            entry_id = %entry.id,
            message_id = %message.id,
            retry_count,
            reason,
            next_retry_at = %entry.next_retry_at,
            "消息进入死信队列"
        );
        Ok(entry)
    }

    pub async fn get_due_for_retry(&self) -> CoordinatorResult<Vec<DeadLetterEntry>> {
        self.store.get_due(Utc::now()).await
    }

    /// 记录新的重试次数并推迟下一次重试时间
    pub async fn update_retry_count(&self, id: &str, new_count: u32) -> CoordinatorResult<bool> {
        let updated = self
            .store
            .update_retry_count(id, new_count, self.next_retry_at(new_count))
            .await?;
        if !updated {
            warn!(entry_id = id, "更新重试次数时死信条目不存在");
        }
        Ok(updated)
    }

    pub async fn remove(&self, id: &str) -> CoordinatorResult<bool> {
        let removed = self.store.remove(id).await?;
        if removed {
            info!(entry_id = id, "死信条目已移除");
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> CoordinatorResult<Option<DeadLetterEntry>> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> CoordinatorResult<Vec<DeadLetterEntry>> {
        self.store.list().await
    }

    pub async fn count(&self) -> CoordinatorResult<u64> {
        self.store.count().await
    }
}
