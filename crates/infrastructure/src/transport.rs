//! 消息投递通道
//!
//! 真实的网络传输不在本仓库范围内；这里提供进程内和仅记录日志两种实现。

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use coordinator_core::CoordinatorResult;
use coordinator_domain::{Message, MessageTransport};

/// 把投递的消息保存在发件箱中，供嵌入方或测试读取
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    outbox: RwLock<Vec<Message>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn delivered(&self) -> Vec<Message> {
        self.outbox.read().await.clone()
    }

    /// 取出并清空发件箱
    pub async fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.outbox.write().await)
    }

    pub async fn len(&self) -> usize {
        self.outbox.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.outbox.read().await.is_empty()
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn deliver(&self, message: &Message) -> CoordinatorResult<()> {
        self.outbox.write().await.push(message.clone());
        Ok(())
    }
}

/// 只记录日志的传输，用于独立运行的二进制
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransport;

#[async_trait]
impl MessageTransport for LoggingTransport {
    fn name(&self) -> &str {
        "logging"
    }

    async fn deliver(&self, message: &Message) -> CoordinatorResult<()> {
        info!(
            message_id = %message.id,
            message_type = %message.message_type,
            recipient = %message.recipient,
            importance = message.importance.as_str(),
            "投递消息"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_domain::MessageType;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_transport_records_outbox() {
        let transport = InMemoryTransport::new();
        assert!(transport.is_empty().await);

        let message = Message::new(MessageType::TaskAssignment, "coordinator", "worker-1", json!({}));
        transport.deliver(&message).await.unwrap();

        assert_eq!(transport.len().await, 1);
        assert_eq!(transport.delivered().await[0].id, message.id);

        let taken = transport.take().await;
        assert_eq!(taken.len(), 1);
        assert!(transport.is_empty().await);
    }

    #[tokio::test]
    async fn test_logging_transport_accepts_everything() {
        let message = Message::new(MessageType::Heartbeat, "worker-1", "coordinator", json!({}));
        assert!(LoggingTransport.deliver(&message).await.is_ok());
        assert_eq!(LoggingTransport.name(), "logging");
    }
}
