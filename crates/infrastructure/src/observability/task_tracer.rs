use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use coordinator_core::CoordinatorResult;
use coordinator_domain::{SpanAttributes, SpanRecord, SpanStatus, TraceBackend, TraceContext};

/// 基于 `tracing` 的追踪后端
///
/// span 记录保存在内存中供查询，同时以日志事件的形式输出。
/// 不负责 span 的导出和存储。
pub struct TaskTracer {
    service_name: String,
    initialized: AtomicBool,
    traces_created: AtomicU64,
}

impl TaskTracer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            initialized: AtomicBool::new(false),
            traces_created: AtomicU64::new(0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn traces_created(&self) -> u64 {
        self.traces_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TraceBackend for TaskTracer {
    async fn initialize(&self) -> CoordinatorResult<()> {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!(service = %self.service_name, "追踪后端已初始化");
        }
        Ok(())
    }

    async fn close(&self) -> CoordinatorResult<()> {
        if self.initialized.swap(false, Ordering::SeqCst) {
            info!(
                service = %self.service_name,
                traces = self.traces_created(),
                "追踪后端已关闭"
            );
        }
        Ok(())
    }

    fn create_trace(&self, name: &str, attributes: SpanAttributes) -> Arc<dyn TraceContext> {
        if !self.is_initialized() {
            warn!(trace = name, "追踪后端未初始化，仍然创建trace");
        }
        self.traces_created.fetch_add(1, Ordering::SeqCst);
        Arc::new(TaskTrace::new(&self.service_name, name, attributes))
    }
}

/// 单个任务的 trace
pub struct TaskTrace {
    trace_id: String,
    name: String,
    span: tracing::Span,
    spans: Mutex<Vec<SpanRecord>>,
    finished: AtomicBool,
}

impl TaskTrace {
    fn new(service_name: &str, name: &str, attributes: SpanAttributes) -> Self {
        let trace_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "task_trace",
            service = service_name,
            trace.id = %trace_id,
            trace.name = name,
        );
        span.in_scope(|| debug!(?attributes, "trace开始"));

        Self {
            trace_id,
            name: name.to_string(),
            span,
            spans: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // 只在同步代码中持有，锁中毒时继续使用内部数据
    fn records(&self) -> MutexGuard<'_, Vec<SpanRecord>> {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TraceContext for TaskTrace {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn start_span(&self, name: &str, attributes: SpanAttributes) -> String {
        let span_id = Uuid::new_v4().to_string();
        self.span
            .in_scope(|| debug!(span.id = %span_id, span.name = name, ?attributes, "span开始"));

        self.records().push(SpanRecord {
            span_id: span_id.clone(),
            trace_id: self.trace_id.clone(),
            name: name.to_string(),
            status: SpanStatus::Open,
            attributes,
            started_at: Utc::now(),
            ended_at: None,
        });
        span_id
    }

    fn end_span(&self, span_id: &str, status: SpanStatus, attributes: SpanAttributes) -> bool {
        let mut records = self.records();
        let Some(record) = records
            .iter_mut()
            .find(|r| r.span_id == span_id && r.ended_at.is_none())
        else {
            return false;
        };

        record.status = status;
        record.attributes.extend(attributes);
        record.ended_at = Some(Utc::now());

        let duration_ms = record.duration_ms().unwrap_or_default();
        let name = record.name.clone();
        drop(records);

        self.span.in_scope(|| match status {
            SpanStatus::Error => {
                warn!(span.id = span_id, span.name = %name, duration_ms, "span以错误结束")
            }
            _ => debug!(span.id = span_id, span.name = %name, duration_ms, "span结束"),
        });
        true
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let now = Utc::now();
        let mut records = self.records();
        for record in records.iter_mut().filter(|r| r.ended_at.is_none()) {
            record.ended_at = Some(now);
        }
        let span_count = records.len();
        drop(records);

        self.span
            .in_scope(|| debug!(span_count, "trace结束"));
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn spans(&self) -> Vec<SpanRecord> {
        self.records().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> SpanAttributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_backend_lifecycle() {
        let tracer = TaskTracer::new("coordinator");
        assert!(!tracer.is_initialized());

        tracer.initialize().await.unwrap();
        assert!(tracer.is_initialized());

        tracer.create_trace("task.T1", SpanAttributes::new());
        assert_eq!(tracer.traces_created(), 1);

        tracer.close().await.unwrap();
        assert!(!tracer.is_initialized());
    }

    #[test]
    fn test_span_lifecycle() {
        let tracer = TaskTracer::new("coordinator");
        let trace = tracer.create_trace("task.T1", attrs(&[("task.id", "T1")]));

        let span_id = trace.start_span("task.claimed", attrs(&[("worker.id", "W1")]));
        assert!(trace.end_span(&span_id, SpanStatus::Ok, attrs(&[("result", "ok")])));
        // 重复结束返回 false
        assert!(!trace.end_span(&span_id, SpanStatus::Ok, SpanAttributes::new()));
        assert!(!trace.end_span("unknown", SpanStatus::Ok, SpanAttributes::new()));

        let spans = trace.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].trace_id, trace.trace_id());
        assert_eq!(spans[0].attributes.get("worker.id").map(String::as_str), Some("W1"));
        assert_eq!(spans[0].attributes.get("result").map(String::as_str), Some("ok"));
        assert!(spans[0].duration_ms().is_some());
    }

    #[test]
    fn test_finish_closes_open_spans() {
        let tracer = TaskTracer::new("coordinator");
        let trace = tracer.create_trace("task.T2", SpanAttributes::new());
        trace.start_span("task.claimed", SpanAttributes::new());

        assert!(!trace.is_finished());
        trace.finish();
        trace.finish();
        assert!(trace.is_finished());
        assert!(trace.spans().iter().all(|s| s.ended_at.is_some()));
    }

    #[test]
    fn test_traces_are_independent() {
        let tracer = TaskTracer::new("coordinator");
        let a = tracer.create_trace("task.A", SpanAttributes::new());
        let b = tracer.create_trace("task.B", SpanAttributes::new());

        a.start_span("task.claimed", SpanAttributes::new());
        assert_ne!(a.trace_id(), b.trace_id());
        assert!(b.spans().is_empty());
    }
}
