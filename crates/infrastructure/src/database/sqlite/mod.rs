pub mod sqlite_claim_store;
pub mod sqlite_dead_letter_store;
pub mod sqlite_message_store;

pub use sqlite_claim_store::SqliteClaimStore;
pub use sqlite_dead_letter_store::SqliteDeadLetterStore;
pub use sqlite_message_store::SqliteMessageStore;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use coordinator_core::CoordinatorResult;

use super::schema;

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 连接SQLite数据库，文件不存在时自动创建
    pub async fn connect(url: &str) -> CoordinatorResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // 内存数据库每个连接都是独立的库，只能使用单连接且不能回收
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(600))
                .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
                .connect_with(options)
                .await?
        };

        info!("已连接SQLite数据库: {}", url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> CoordinatorResult<()> {
        schema::create_message_tables(&self.pool).await?;
        schema::create_dead_letter_tables(&self.pool).await?;
        schema::create_claim_tables(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
