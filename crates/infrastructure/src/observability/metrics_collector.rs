//! 协调器指标
//!
//! 通过 `metrics` 门面记录；未安装 recorder 时所有调用都是空操作。

use metrics::{counter, gauge, histogram};
use tracing::debug;

use crate::circuit_breaker::CircuitState;

const PREFIX: &str = "coordinator";

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    fn name(&self, metric: &str) -> String {
        format!("{PREFIX}_{metric}")
    }

    // 消息

    pub fn record_message_sent(&self, message_type: &str) {
        counter!(self.name("messages_sent_total"), "type" => message_type.to_string()).increment(1);
    }

    pub fn record_message_delivered(&self, message_type: &str) {
        counter!(self.name("messages_delivered_total"), "type" => message_type.to_string())
            .increment(1);
    }

    pub fn record_delivery_failure(&self, message_type: &str, retry_count: u32) {
        counter!(self.name("message_delivery_failures_total"), "type" => message_type.to_string())
            .increment(1);
        debug!(message_type, retry_count, "消息投递失败");
    }

    pub fn record_message_acknowledged(&self, duplicate: bool) {
        let outcome = if duplicate { "duplicate" } else { "first" };
        counter!(self.name("messages_acknowledged_total"), "outcome" => outcome).increment(1);
    }

    pub fn record_dead_lettered(&self, reason: &str) {
        counter!(self.name("dead_letters_total"), "reason" => reason.to_string()).increment(1);
    }

    pub fn record_dead_letter_retry(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!(self.name("dead_letter_retries_total"), "outcome" => outcome).increment(1);
    }

    // 认领

    pub fn record_claims_granted(&self, count: usize) {
        counter!(self.name("claims_granted_total")).increment(count as u64);
    }

    pub fn record_claim_rejected(&self, reason: &str) {
        counter!(self.name("claims_rejected_total"), "reason" => reason.to_string()).increment(1);
    }

    pub fn record_task_finished(&self, outcome: &str) {
        counter!(self.name("tasks_finished_total"), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_reassignments(&self, count: usize) {
        if count > 0 {
            counter!(self.name("task_reassignments_total")).increment(count as u64);
        }
    }

    // 状态快照

    pub fn update_worker_counts(&self, active: usize, stale: usize, offline: usize) {
        gauge!(self.name("workers"), "status" => "active").set(active as f64);
        gauge!(self.name("workers"), "status" => "stale").set(stale as f64);
        gauge!(self.name("workers"), "status" => "offline").set(offline as f64);
    }

    pub fn update_queue_depth(&self, depth: usize) {
        gauge!(self.name("queue_depth")).set(depth as f64);
    }

    pub fn update_active_claims(&self, count: usize) {
        gauge!(self.name("active_claims")).set(count as f64);
    }

    pub fn update_circuit_state(&self, breaker: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        gauge!(self.name("circuit_breaker_state"), "breaker" => breaker.to_string()).set(value);
    }

    pub fn record_reconcile_duration(&self, duration_seconds: f64) {
        histogram!(self.name("reconcile_duration_seconds")).record(duration_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.name("queue_depth"), "coordinator_queue_depth");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_message_sent("TASK_COMPLETE");
        collector.record_message_acknowledged(true);
        collector.record_claims_granted(2);
        collector.record_claim_rejected("already_claimed");
        collector.update_worker_counts(1, 0, 2);
        collector.update_circuit_state("message_dispatch", CircuitState::Open);
        collector.record_reconcile_duration(0.01);
    }
}
