use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use coordinator_core::{CoordinatorError, CoordinatorResult};
use coordinator_domain::{ClaimRecord, ClaimStatus, ClaimStore, TaskRef};

use crate::database::{from_millis, schema, to_millis};

const STATUS_PENDING: &str = "pending";

/// SQLite 认领台账
///
/// 比较并设置依赖 `task_id` 主键和带条件的 upsert/update，
/// 通过 `rows_affected` 判断本次调用是否赢得了转换。
pub struct SqliteClaimStore {
    pool: SqlitePool,
}

impl SqliteClaimStore {
    /// 创建存储并确保表存在
    pub async fn new(pool: SqlitePool) -> CoordinatorResult<Self> {
        schema::create_claim_tables(&pool).await?;
        Ok(Self { pool })
    }

    fn row_to_task(row: &SqliteRow) -> CoordinatorResult<TaskRef> {
        let payload: String = row.try_get("payload")?;
        Ok(TaskRef {
            task_id: row.try_get("task_id")?,
            capability: row.try_get("capability")?,
            payload: serde_json::from_str(&payload)?,
            submitted_at: from_millis(row.try_get("submitted_at")?)?,
        })
    }

    fn row_to_record(row: &SqliteRow) -> CoordinatorResult<ClaimRecord> {
        let status: String = row.try_get("status")?;
        let worker_id: Option<String> = row.try_get("worker_id")?;
        let claimed_at: Option<i64> = row.try_get("claimed_at")?;
        let updated_at = from_millis(row.try_get("updated_at")?)?;

        Ok(ClaimRecord {
            task: Self::row_to_task(row)?,
            worker_id: worker_id.unwrap_or_default(),
            claimed_at: claimed_at.map(from_millis).transpose()?.unwrap_or(updated_at),
            status: parse_status(&status)?,
            updated_at,
        })
    }
}

fn parse_status(value: &str) -> CoordinatorResult<ClaimStatus> {
    match value {
        "claimed" => Ok(ClaimStatus::Claimed),
        "completed" => Ok(ClaimStatus::Completed),
        "failed" => Ok(ClaimStatus::Failed),
        "abandoned" => Ok(ClaimStatus::Abandoned),
        other => Err(CoordinatorError::Serialization(format!(
            "无效的认领状态: {other}"
        ))),
    }
}

const SELECT_COLUMNS: &str = "SELECT task_id, capability, payload, submitted_at, status, worker_id, claimed_at, updated_at FROM task_claims";

#[async_trait]
impl ClaimStore for SqliteClaimStore {
    async fn enqueue(&self, task: &TaskRef) -> CoordinatorResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_claims
                (task_id, capability, payload, submitted_at, status, worker_id, claimed_at, updated_at, position)
            VALUES ($1, $2, $3, $4, 'pending', NULL, NULL, $5,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM task_claims))
            ON CONFLICT (task_id) DO UPDATE SET
                capability = excluded.capability,
                payload = excluded.payload,
                submitted_at = excluded.submitted_at,
                status = 'pending',
                worker_id = NULL,
                claimed_at = NULL,
                updated_at = excluded.updated_at,
                position = excluded.position
            WHERE task_claims.status IN ('completed', 'failed')
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.capability)
        .bind(serde_json::to_string(&task.payload)?)
        .bind(to_millis(task.submitted_at))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending(&self) -> CoordinatorResult<Vec<TaskRef>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('pending', 'abandoned') ORDER BY position ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn find_pending(&self, task_id: &str) -> CoordinatorResult<Option<TaskRef>> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE task_id = $1 AND status IN ('pending', 'abandoned')"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn get(&self, task_id: &str) -> CoordinatorResult<Option<ClaimRecord>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE task_id = $1 AND status != $2"))
            .bind(task_id)
            .bind(STATUS_PENDING)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn try_claim(
        &self,
        task: &TaskRef,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        // 已排队的任务保留入队时的内容
        let result = sqlx::query(
            r#"
            INSERT INTO task_claims
                (task_id, capability, payload, submitted_at, status, worker_id, claimed_at, updated_at, position)
            VALUES ($1, $2, $3, $4, 'claimed', $5, $6, $6, NULL)
            ON CONFLICT (task_id) DO UPDATE SET
                status = 'claimed',
                worker_id = excluded.worker_id,
                claimed_at = excluded.claimed_at,
                updated_at = excluded.updated_at,
                position = NULL
            WHERE task_claims.status IN ('pending', 'abandoned')
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.capability)
        .bind(serde_json::to_string(&task.payload)?)
        .bind(to_millis(task.submitted_at))
        .bind(worker_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(
        &self,
        task_id: &str,
        worker_id: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let result = sqlx::query(
            "UPDATE task_claims SET status = $3, updated_at = $4 WHERE task_id = $1 AND worker_id = $2 AND status = 'claimed'",
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reopen(
        &self,
        task_id: &str,
        worker_id: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let result = sqlx::query(
            "UPDATE task_claims SET status = 'claimed', updated_at = $4 WHERE task_id = $1 AND worker_id = $2 AND status = $3",
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn abandon(
        &self,
        task_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_claims SET
                status = 'abandoned',
                updated_at = $3,
                position = (SELECT COALESCE(MIN(position), 0) - 1 FROM task_claims)
            WHERE task_id = $1 AND worker_id = $2 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        let abandoned = result.rows_affected() > 0;
        if abandoned {
            debug!("认领已放弃，任务回到队首: {}", task_id);
        }
        Ok(abandoned)
    }

    async fn active_claims(&self) -> CoordinatorResult<Vec<ClaimRecord>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = 'claimed' ORDER BY claimed_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn pending_count(&self) -> CoordinatorResult<u64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM task_claims WHERE status IN ('pending', 'abandoned')",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use serde_json::json;

    async fn setup() -> (DatabaseManager, SqliteClaimStore) {
        let manager = DatabaseManager::connect("sqlite::memory:").await.unwrap();
        let store = SqliteClaimStore::new(manager.pool().clone()).await.unwrap();
        (manager, store)
    }

    fn pending_ids(tasks: Vec<TaskRef>) -> Vec<String> {
        tasks.into_iter().map(|t| t.task_id).collect()
    }

    #[tokio::test]
    async fn test_enqueue_keeps_fifo_order() {
        let (_manager, store) = setup().await;
        let task = TaskRef::new("T1", "task-execution").with_payload(json!({"n": 1}));
        assert!(store.enqueue(&task).await.unwrap());
        assert!(store
            .enqueue(&TaskRef::new("T2", "task-execution"))
            .await
            .unwrap());
        assert!(!store.enqueue(&task).await.unwrap());

        let pending = store.pending().await.unwrap();
        assert_eq!(pending[0].payload["n"], 1);
        assert_eq!(pending_ids(pending), vec!["T1", "T2"]);
        assert_eq!(store.pending_count().await.unwrap(), 2);
        // 从未认领的任务没有认领记录
        assert!(store.get("T1").await.unwrap().is_none());
        assert!(store.find_pending("T1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_try_claim_is_compare_and_set() {
        let (_manager, store) = setup().await;
        let task = TaskRef::new("T1", "task-execution");
        store.enqueue(&task).await.unwrap();

        assert!(store.try_claim(&task, "W1", Utc::now()).await.unwrap());
        assert!(!store.try_claim(&task, "W2", Utc::now()).await.unwrap());
        assert!(!store.enqueue(&task).await.unwrap());

        let record = store.get("T1").await.unwrap().unwrap();
        assert_eq!(record.worker_id, "W1");
        assert_eq!(record.status, ClaimStatus::Claimed);
        assert_eq!(store.pending_count().await.unwrap(), 0);

        // 不在队列中的任务也可以直接认领
        let adhoc = TaskRef::new("adhoc-1", "");
        assert!(store.try_claim(&adhoc, "W2", Utc::now()).await.unwrap());
        assert_eq!(store.active_claims().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_release_reopen_and_resubmit() {
        let (_manager, store) = setup().await;
        let task = TaskRef::new("T1", "task-execution");
        store.try_claim(&task, "W1", Utc::now()).await.unwrap();

        assert!(!store
            .release("T1", "W2", ClaimStatus::Completed, Utc::now())
            .await
            .unwrap());
        assert!(store
            .release("T1", "W1", ClaimStatus::Completed, Utc::now())
            .await
            .unwrap());
        assert!(!store
            .release("T1", "W1", ClaimStatus::Completed, Utc::now())
            .await
            .unwrap());

        assert!(store
            .reopen("T1", "W1", ClaimStatus::Completed, Utc::now())
            .await
            .unwrap());
        assert_eq!(store.get("T1").await.unwrap().unwrap().status, ClaimStatus::Claimed);

        store
            .release("T1", "W1", ClaimStatus::Failed, Utc::now())
            .await
            .unwrap();
        assert!(store.enqueue(&task).await.unwrap());
        assert_eq!(pending_ids(store.pending().await.unwrap()), vec!["T1"]);
    }

    #[tokio::test]
    async fn test_abandon_puts_task_in_front() {
        let (_manager, store) = setup().await;
        let first = TaskRef::new("T1", "task-execution");
        store.enqueue(&first).await.unwrap();
        store.try_claim(&first, "W1", Utc::now()).await.unwrap();
        store
            .enqueue(&TaskRef::new("T2", "task-execution"))
            .await
            .unwrap();

        assert!(!store.abandon("T1", "W2", Utc::now()).await.unwrap());
        assert!(store.abandon("T1", "W1", Utc::now()).await.unwrap());
        assert_eq!(pending_ids(store.pending().await.unwrap()), vec!["T1", "T2"]);
        assert_eq!(
            store.get("T1").await.unwrap().unwrap().status,
            ClaimStatus::Abandoned
        );

        assert!(store.try_claim(&first, "W2", Utc::now()).await.unwrap());
        assert_eq!(store.get("T1").await.unwrap().unwrap().worker_id, "W2");
    }
}
