pub mod schema;
pub mod sqlite;

pub use sqlite::{DatabaseManager, SqliteClaimStore, SqliteDeadLetterStore, SqliteMessageStore};

use chrono::{DateTime, Utc};
use coordinator_core::{CoordinatorError, CoordinatorResult};

/// 时间戳以毫秒整数形式存储
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> CoordinatorResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CoordinatorError::Serialization(format!("无效的时间戳: {ms}")))
}
