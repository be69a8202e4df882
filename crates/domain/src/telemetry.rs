//! 追踪后端接口
//!
//! 每个任务的生命周期（认领到完成）对应一条 trace，生命周期事件对应 span。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coordinator_core::CoordinatorResult;

pub type SpanAttributes = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Open,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub span_id: String,
    pub trace_id: String,
    pub name: String,
    pub status: SpanStatus,
    pub attributes: SpanAttributes,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SpanRecord {
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// 一条打开的 trace
pub trait TraceContext: Send + Sync {
    fn trace_id(&self) -> &str;
    /// 打开 span，返回 span id
    fn start_span(&self, name: &str, attributes: SpanAttributes) -> String;
    /// 结束 span；未知或已结束的 span 返回 false
    fn end_span(&self, span_id: &str, status: SpanStatus, attributes: SpanAttributes) -> bool;
    fn finish(&self);
    fn is_finished(&self) -> bool;
    fn spans(&self) -> Vec<SpanRecord>;
}

/// 进程级追踪设施，随协调器初始化和关闭
#[async_trait]
pub trait TraceBackend: Send + Sync {
    async fn initialize(&self) -> CoordinatorResult<()>;
    async fn close(&self) -> CoordinatorResult<()>;
    fn create_trace(&self, name: &str, attributes: SpanAttributes) -> Arc<dyn TraceContext>;
}
