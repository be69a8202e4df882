use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use coordinator_core::{CoordinatorError, CoordinatorResult};
use coordinator_domain::{AckResult, Message, MessageStats, MessageStore};

use crate::database::{from_millis, schema, to_millis};

/// 基于SQLite的追加式消息存储
///
/// 消息体以JSON保存；确认记录单独成表，消息行写入后不再修改。
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn initialize(&self) -> CoordinatorResult<()> {
        schema::create_message_tables(&self.pool).await
    }

    async fn close(&self) -> CoordinatorResult<()> {
        // 连接池由 DatabaseManager 统一关闭
        debug!("SQLite消息存储已关闭");
        Ok(())
    }

    async fn append(&self, message: &Message) -> CoordinatorResult<()> {
        let body = message.to_json()?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, message_type, sender, recipient, importance, body, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&message.id)
        .bind(message.message_type.as_str())
        .bind(&message.sender)
        .bind(&message.recipient)
        .bind(message.importance.as_str())
        .bind(body)
        .bind(to_millis(message.timestamp))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("消息已持久化: {}", message.id);
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                CoordinatorError::persistence(format!("消息已存在，拒绝覆盖: {}", message.id)),
            ),
            Err(e) => Err(CoordinatorError::Database(e)),
        }
    }

    async fn get(&self, message_id: &str) -> CoordinatorResult<Option<Message>> {
        let row = sqlx::query("SELECT body FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(Message::from_json(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn acknowledge(
        &self,
        message_id: &str,
        recipient_id: &str,
    ) -> CoordinatorResult<AckResult> {
        let row = sqlx::query("SELECT recipient FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            warn!(message_id, recipient_id, "确认未知消息，忽略");
            return Ok(AckResult::rejected());
        };

        let recipient: String = row.try_get("recipient")?;
        if recipient != recipient_id {
            warn!(
                message_id,
                recipient_id,
                expected = %recipient,
                "确认者不是消息接收方，忽略"
            );
            return Ok(AckResult::rejected());
        }

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO acknowledgments (message_id, recipient, acknowledged_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(message_id)
        .bind(recipient_id)
        .bind(to_millis(chrono::Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(message_id, "消息已确认过");
            Ok(AckResult::duplicate())
        } else {
            Ok(AckResult::acknowledged())
        }
    }

    async fn stats(&self) -> CoordinatorResult<MessageStats> {
        let mut stats = MessageStats::default();

        let rows = sqlx::query(
            "SELECT message_type, COUNT(*) AS count FROM messages GROUP BY message_type",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let message_type: String = row.try_get("message_type")?;
            let count: i64 = row.try_get("count")?;
            stats.sent += count as u64;
            stats.by_type.insert(message_type, count as u64);
        }

        let acknowledged: i64 = sqlx::query("SELECT COUNT(*) AS count FROM acknowledgments")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        stats.acknowledged = acknowledged as u64;
        stats.pending = stats.sent.saturating_sub(stats.acknowledged);

        let last_sent: Option<i64> = sqlx::query("SELECT MAX(sent_at) AS last_sent FROM messages")
            .fetch_one(&self.pool)
            .await?
            .try_get("last_sent")?;
        stats.last_sent_at = last_sent.map(from_millis).transpose()?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use coordinator_domain::{Importance, MessageType};
    use serde_json::json;

    async fn setup() -> (DatabaseManager, SqliteMessageStore) {
        let manager = DatabaseManager::connect("sqlite::memory:").await.unwrap();
        let store = SqliteMessageStore::new(manager.pool().clone());
        store.initialize().await.unwrap();
        (manager, store)
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let (_manager, store) = setup().await;
        let message = Message::new(
            MessageType::TaskAssignment,
            "coordinator",
            "worker-1",
            json!({"task_id": "T1"}),
        )
        .with_importance(Importance::High);

        store.append(&message).await.unwrap();
        let loaded = store.get(&message.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, message.id);
        assert_eq!(loaded.importance, Importance::High);
        assert_eq!(loaded.payload, message.payload);
    }

    #[tokio::test]
    async fn test_duplicate_append_is_rejected() {
        let (_manager, store) = setup().await;
        let message = Message::new(MessageType::Heartbeat, "worker-1", "coordinator", json!({}));

        store.append(&message).await.unwrap();
        let err = store.append(&message).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_acknowledge_flow() {
        let (_manager, store) = setup().await;
        let message = Message::new(MessageType::StatusUpdate, "coordinator", "worker-1", json!({}));
        store.append(&message).await.unwrap();

        assert!(!store.acknowledge(&message.id, "worker-2").await.unwrap().success);
        assert!(!store.acknowledge("missing", "worker-1").await.unwrap().success);

        let first = store.acknowledge(&message.id, "worker-1").await.unwrap();
        assert_eq!(first, AckResult::acknowledged());
        let second = store.acknowledge(&message.id, "worker-1").await.unwrap();
        assert_eq!(second, AckResult::duplicate());
    }

    #[tokio::test]
    async fn test_stats() {
        let (_manager, store) = setup().await;
        let empty = store.stats().await.unwrap();
        assert_eq!(empty.sent, 0);
        assert!(empty.last_sent_at.is_none());

        let a = Message::new(MessageType::TaskComplete, "worker-1", "coordinator", json!({}));
        let b = Message::new(MessageType::TaskComplete, "worker-2", "coordinator", json!({}));
        let c = Message::new(MessageType::ErrorReport, "worker-2", "coordinator", json!({}));
        for m in [&a, &b, &c] {
            store.append(m).await.unwrap();
        }
        store.acknowledge(&a.id, "coordinator").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.by_type.get("TASK_COMPLETE"), Some(&2));
        assert_eq!(stats.by_type.get("ERROR_REPORT"), Some(&1));
        assert!(stats.last_sent_at.is_some());
    }

    #[tokio::test]
    async fn test_messages_survive_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("messages.db").display());
        let message = Message::new(MessageType::TaskFailed, "worker-1", "coordinator", json!({}));

        {
            let manager = DatabaseManager::connect(&url).await.unwrap();
            let store = SqliteMessageStore::new(manager.pool().clone());
            store.initialize().await.unwrap();
            store.append(&message).await.unwrap();
            manager.close().await;
        }

        let manager = DatabaseManager::connect(&url).await.unwrap();
        let store = SqliteMessageStore::new(manager.pool().clone());
        store.initialize().await.unwrap();
        assert!(store.get(&message.id).await.unwrap().is_some());
        assert_eq!(store.stats().await.unwrap().sent, 1);
    }
}
