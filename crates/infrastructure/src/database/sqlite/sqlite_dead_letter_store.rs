use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use coordinator_core::CoordinatorResult;
use coordinator_domain::{DeadLetterEntry, DeadLetterStore, Message};

use crate::database::{from_millis, schema, to_millis};

pub struct SqliteDeadLetterStore {
    pool: SqlitePool,
}

impl SqliteDeadLetterStore {
    /// 创建存储并确保表存在
    pub async fn new(pool: SqlitePool) -> CoordinatorResult<Self> {
        schema::create_dead_letter_tables(&pool).await?;
        Ok(Self { pool })
    }

    fn row_to_entry(row: &SqliteRow) -> CoordinatorResult<DeadLetterEntry> {
        let body: String = row.try_get("body")?;
        let retry_count: i64 = row.try_get("retry_count")?;

        Ok(DeadLetterEntry {
            id: row.try_get("id")?,
            message: Message::from_json(&body)?,
            reason: row.try_get("reason")?,
            retry_count: retry_count.max(0) as u32,
            next_retry_at: from_millis(row.try_get("next_retry_at")?)?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, body, reason, retry_count, next_retry_at, created_at, updated_at FROM dead_letters";

#[async_trait]
impl DeadLetterStore for SqliteDeadLetterStore {
    async fn store(&self, entry: &DeadLetterEntry) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dead_letters
                (id, body, reason, retry_count, next_retry_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&entry.id)
        .bind(entry.message.to_json()?)
        .bind(&entry.reason)
        .bind(entry.retry_count as i64)
        .bind(to_millis(entry.next_retry_at))
        .bind(to_millis(entry.created_at))
        .bind(to_millis(entry.updated_at))
        .execute(&self.pool)
        .await?;

        debug!("死信已持久化: {}", entry.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> CoordinatorResult<Option<DeadLetterEntry>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn get_due(&self, now: DateTime<Utc>) -> CoordinatorResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE next_retry_at <= $1 ORDER BY next_retry_at ASC, created_at ASC"
        ))
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn update_retry_count(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let result = sqlx::query(
            "UPDATE dead_letters SET retry_count = $2, next_retry_at = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(retry_count as i64)
        .bind(to_millis(next_retry_at))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, id: &str) -> CoordinatorResult<bool> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> CoordinatorResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} ORDER BY next_retry_at ASC, created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn count(&self) -> CoordinatorResult<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM dead_letters")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(count as u64)
    }
}
