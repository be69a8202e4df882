use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use coordinator_core::{CoordinatorError, CoordinatorResult};
use coordinator_domain::{AckResult, Message, MessageStats, MessageStore};

#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    acknowledged_at: Option<DateTime<Utc>>,
}

/// 内存消息存储
#[derive(Debug)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<String, StoredMessage>>,
    open: AtomicBool,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            open: AtomicBool::new(true),
        }
    }

    fn ensure_open(&self) -> CoordinatorResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinatorError::persistence("消息存储已关闭"))
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn initialize(&self) -> CoordinatorResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> CoordinatorResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn append(&self, message: &Message) -> CoordinatorResult<()> {
        self.ensure_open()?;

        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Err(CoordinatorError::persistence(format!(
                "消息已存在，拒绝覆盖: {}",
                message.id
            )));
        }
        messages.insert(
            message.id.clone(),
            StoredMessage {
                message: message.clone(),
                acknowledged_at: None,
            },
        );

        debug!(message_id = %message.id, message_type = %message.message_type, "消息已写入内存存储");
        Ok(())
    }

    async fn get(&self, message_id: &str) -> CoordinatorResult<Option<Message>> {
        self.ensure_open()?;
        Ok(self
            .messages
            .read()
            .await
            .get(message_id)
            .map(|stored| stored.message.clone()))
    }

    async fn acknowledge(
        &self,
        message_id: &str,
        recipient_id: &str,
    ) -> CoordinatorResult<AckResult> {
        self.ensure_open()?;

        let mut messages = self.messages.write().await;
        let Some(stored) = messages.get_mut(message_id) else {
            warn!(message_id, recipient_id, "确认未知消息，忽略");
            return Ok(AckResult::rejected());
        };

        if stored.message.recipient != recipient_id {
            warn!(
                message_id,
                recipient_id,
                expected = %stored.message.recipient,
                "确认者不是消息接收方，忽略"
            );
            return Ok(AckResult::rejected());
        }

        if stored.acknowledged_at.is_some() {
            debug!(message_id, "消息已确认过");
            return Ok(AckResult::duplicate());
        }

        stored.acknowledged_at = Some(Utc::now());
        Ok(AckResult::acknowledged())
    }

    async fn stats(&self) -> CoordinatorResult<MessageStats> {
        let messages = self.messages.read().await;
        let mut stats = MessageStats::default();

        for stored in messages.values() {
            stats.sent += 1;
            if stored.acknowledged_at.is_some() {
                stats.acknowledged += 1;
            }
            *stats
                .by_type
                .entry(stored.message.message_type.as_str().to_string())
                .or_insert(0) += 1;
            if stats
                .last_sent_at
                .is_none_or(|last| stored.message.timestamp > last)
            {
                stats.last_sent_at = Some(stored.message.timestamp);
            }
        }
        stats.pending = stats.sent - stats.acknowledged;

        Ok(stats)
    }
}
