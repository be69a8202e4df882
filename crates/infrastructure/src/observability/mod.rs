//! 可观测性
//!
//! 任务生命周期追踪与 Prometheus 指标。

pub mod metrics_collector;
pub mod task_tracer;

pub use metrics_collector::MetricsCollector;
pub use task_tracer::{TaskTrace, TaskTracer};
