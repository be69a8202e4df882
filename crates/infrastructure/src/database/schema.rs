//! SQLite 表结构
//!
//! 所有语句都是幂等的，可以在每次启动时执行。

use sqlx::SqlitePool;
use tracing::debug;

use coordinator_core::CoordinatorResult;

const MESSAGE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        message_type TEXT NOT NULL,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        importance TEXT NOT NULL,
        body TEXT NOT NULL,
        sent_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages (sent_at)",
    r#"
    CREATE TABLE IF NOT EXISTS acknowledgments (
        message_id TEXT PRIMARY KEY REFERENCES messages (id),
        recipient TEXT NOT NULL,
        acknowledged_at INTEGER NOT NULL
    )
    "#,
];

const DEAD_LETTER_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        reason TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        next_retry_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_dead_letters_next_retry_at ON dead_letters (next_retry_at)",
];

// position 决定待认领顺序：入队取最大值加一，放弃的任务取最小值减一
const CLAIM_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS task_claims (
        task_id TEXT PRIMARY KEY,
        capability TEXT NOT NULL,
        payload TEXT NOT NULL,
        submitted_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        worker_id TEXT,
        claimed_at INTEGER,
        updated_at INTEGER NOT NULL,
        position INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_claims_status ON task_claims (status, position)",
    "CREATE INDEX IF NOT EXISTS idx_task_claims_worker ON task_claims (worker_id, status)",
];

async fn execute_all(pool: &SqlitePool, statements: &[&str]) -> CoordinatorResult<()> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn create_message_tables(pool: &SqlitePool) -> CoordinatorResult<()> {
    execute_all(pool, MESSAGE_TABLES).await?;
    debug!("消息表已就绪");
    Ok(())
}

pub async fn create_dead_letter_tables(pool: &SqlitePool) -> CoordinatorResult<()> {
    execute_all(pool, DEAD_LETTER_TABLES).await?;
    debug!("死信表已就绪");
    Ok(())
}

pub async fn create_claim_tables(pool: &SqlitePool) -> CoordinatorResult<()> {
    execute_all(pool, CLAIM_TABLES).await?;
    debug!("认领表已就绪");
    Ok(())
}
