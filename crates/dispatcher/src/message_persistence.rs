use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use coordinator_core::{CoordinatorError, CoordinatorResult};
use coordinator_domain::{AckResult, Message, MessageStats, MessageStore};

/// 出站消息持久化
///
/// `store_outgoing` 返回成功时消息已经写入底层存储；写入失败原样返回给调用方。
pub struct MessagePersistence {
    store: Arc<dyn MessageStore>,
    initialized: AtomicBool,
}

impl MessagePersistence {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn initialize(&self) -> CoordinatorResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.store.initialize().await?;
        self.initialized.store(true, Ordering::SeqCst);
        info!("消息持久化已初始化");
        Ok(())
    }

    pub async fn close(&self) -> CoordinatorResult<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.close().await?;
        info!("消息持久化已关闭");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub async fn store_outgoing(&self, message: &Message) -> CoordinatorResult<()> {
        if message.id.is_empty() {
            return Err(CoordinatorError::validation_error("消息id不能为空"));
        }
        self.store.append(message).await?;
        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            recipient = %message.recipient,
            "出站消息已持久化"
        );
        Ok(())
    }

    pub async fn acknowledge(
        &self,
        message_id: &str,
        recipient_id: &str,
    ) -> CoordinatorResult<AckResult> {
        let result = self.store.acknowledge(message_id, recipient_id).await?;
        if result.already_acknowledged {
            debug!(message_id, recipient_id, "重复确认");
        }
        Ok(result)
    }

    pub async fn get(&self, message_id: &str) -> CoordinatorResult<Option<Message>> {
        self.store.get(message_id).await
    }

    pub async fn get_stats(&self) -> CoordinatorResult<MessageStats> {
        self.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FailingMessageStore;
    use coordinator_domain::MessageType;
    use coordinator_infrastructure::InMemoryMessageStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_and_acknowledge() {
        let persistence = MessagePersistence::new(Arc::new(InMemoryMessageStore::new()));
        persistence.initialize().await.unwrap();
        assert!(persistence.is_initialized());

        let message = Message::new(MessageType::TaskAssignment, "coordinator", "W1", json!({}));
        persistence.store_outgoing(&message).await.unwrap();

        let ack = persistence.acknowledge(&message.id, "W1").await.unwrap();
        assert!(ack.success && !ack.already_acknowledged);
        let again = persistence.acknowledge(&message.id, "W1").await.unwrap();
        assert!(again.success && again.already_acknowledged);

        let stats = persistence.get_stats().await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.pending, 0);

        persistence.close().await.unwrap();
        assert!(!persistence.is_initialized());
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let persistence = MessagePersistence::new(Arc::new(FailingMessageStore::new()));
        let message = Message::new(MessageType::StatusUpdate, "coordinator", "W1", json!({}));

        let err = persistence.store_outgoing(&message).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Persistence(_)));
    }
}
