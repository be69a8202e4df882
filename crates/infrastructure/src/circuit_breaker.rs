//! Circuit breaker implementation for resilience
//!
//! Guards operations prone to cascading failure (message dispatch, claims)
//! behind a CLOSED / OPEN / HALF_OPEN state machine.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use coordinator_core::{CoordinatorConfig, CoordinatorError, CoordinatorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 1,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_coordinator_config(config: &CoordinatorConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold,
            reset_timeout: config.circuit_breaker_reset_timeout(),
            success_threshold: config.circuit_breaker_success_threshold,
            call_timeout: config.circuit_breaker_call_timeout(),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// 连续失败次数
    pub failure_count: u32,
    pub consecutive_successes: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// 因熔断而未执行的调用
    pub rejected_calls: u64,
    #[serde(skip)]
    pub last_state_change: Instant,
}

impl CircuitBreakerStats {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            consecutive_successes: 0,
            failure_threshold: config.failure_threshold,
            reset_timeout_ms: config.reset_timeout.as_millis() as u64,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            last_state_change: Instant::now(),
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    stats: Arc<RwLock<CircuitBreakerStats>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default")
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let stats = CircuitBreakerStats::new(&config);
        Self {
            name: name.into(),
            config,
            stats: Arc::new(RwLock::new(stats)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 在熔断器保护下执行操作
    ///
    /// OPEN 状态下直接返回 [`CoordinatorError::CircuitOpen`]，不会调用 `operation`。
    pub async fn execute<F, Fut, T>(&self, operation: F) -> CoordinatorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoordinatorResult<T>>,
    {
        if !self.should_allow_call().await {
            self.stats.write().await.rejected_calls += 1;
            debug!(breaker = %self.name, "熔断器打开，拒绝调用");
            return Err(CoordinatorError::circuit_open(self.name.clone()));
        }

        let result = tokio::time::timeout(self.config.call_timeout, operation()).await;

        match result {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record_failure().await;
                Err(error)
            }
            Err(_) => {
                self.record_failure().await;
                Err(CoordinatorError::Timeout(format!(
                    "{} 调用超过 {}ms",
                    self.name,
                    self.config.call_timeout.as_millis()
                )))
            }
        }
    }

    async fn should_allow_call(&self) -> bool {
        let (state, since_change) = {
            let stats = self.stats.read().await;
            (stats.state, stats.last_state_change.elapsed())
        };

        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if since_change >= self.config.reset_timeout {
                    self.transition_to_half_open().await;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut stats = self.stats.write().await;

        stats.total_calls += 1;
        stats.successful_calls += 1;
        stats.consecutive_successes += 1;
        stats.failure_count = 0;

        if stats.state == CircuitState::HalfOpen
            && stats.consecutive_successes >= self.config.success_threshold
        {
            stats.state = CircuitState::Closed;
            stats.last_state_change = Instant::now();
            info!(breaker = %self.name, "试探调用成功，熔断器关闭");
        }
    }

    async fn record_failure(&self) {
        let mut stats = self.stats.write().await;

        stats.total_calls += 1;
        stats.failed_calls += 1;
        stats.failure_count += 1;
        stats.consecutive_successes = 0;

        let state = stats.state;
        match state {
            CircuitState::Closed if stats.failure_count >= self.config.failure_threshold => {
                stats.state = CircuitState::Open;
                stats.last_state_change = Instant::now();
                warn!(
                    breaker = %self.name,
                    failures = stats.failure_count,
                    "连续失败达到阈值，熔断器打开"
                );
            }
            CircuitState::HalfOpen => {
                // 试探失败：重新打开并重新计时
                stats.state = CircuitState::Open;
                stats.last_state_change = Instant::now();
                warn!(breaker = %self.name, "试探调用失败，熔断器重新打开");
            }
            _ => {}
        }
    }

    async fn transition_to_half_open(&self) {
        let mut stats = self.stats.write().await;
        // 并发调用可能已经完成了迁移
        if stats.state == CircuitState::Open {
            stats.state = CircuitState::HalfOpen;
            stats.last_state_change = Instant::now();
            stats.consecutive_successes = 0;
            info!(breaker = %self.name, "熔断器进入半开状态");
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.stats.read().await.state
    }

    pub async fn get_stats(&self) -> CircuitBreakerStats {
        self.stats.read().await.clone()
    }

    pub async fn reset(&self) {
        let mut stats = self.stats.write().await;
        *stats = CircuitBreakerStats::new(&self.config);
    }

    pub async fn force_open(&self) {
        let mut stats = self.stats.write().await;
        stats.state = CircuitState::Open;
        stats.last_state_change = Instant::now();
    }
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::with_config(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
                success_threshold: 1,
                call_timeout: Duration::from_secs(5),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> CoordinatorResult<()> {
        cb.execute(|| async { Err(CoordinatorError::dispatch("Test error")) })
            .await
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_state() {
        let cb = CircuitBreaker::new("test");
        assert_eq!(cb.get_state().await, CircuitState::Closed);

        let result = cb.execute(|| async { Ok::<(), CoordinatorError>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_exactly_threshold_failures() {
        let cb = test_breaker(3, 10_000);

        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.get_state().await, CircuitState::Closed);

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.get_state().await, CircuitState::Open);
        assert_eq!(cb.get_stats().await.failure_count, 3);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking_operation() {
        let cb = test_breaker(2, 10_000);
        for _ in 0..2 {
            let _ = fail(&cb).await;
        }

        let invoked = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), CoordinatorError>(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.get_stats().await.rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let cb = test_breaker(2, 50);
        for _ in 0..2 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let invoked = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), CoordinatorError>(())
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(cb.get_state().await, CircuitState::Closed);
        assert_eq!(cb.get_stats().await.failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let cb = test_breaker(1, 50);
        let _ = fail(&cb).await;
        assert_eq!(cb.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let err = fail(&cb).await.unwrap_err();
        assert!(!err.is_circuit_open());
        assert_eq!(cb.get_state().await, CircuitState::Open);

        // 超时重新计时，立即调用仍被拒绝
        assert!(fail(&cb).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = test_breaker(3, 10_000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        cb.execute(|| async { Ok::<(), CoordinatorError>(()) })
            .await
            .unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let cb = CircuitBreaker::with_config(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(10),
                success_threshold: 1,
                call_timeout: Duration::from_millis(20),
            },
        );

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), CoordinatorError>(())
            })
            .await;

        assert!(matches!(result, Err(CoordinatorError::Timeout(_))));
        assert_eq!(cb.get_state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let cb = test_breaker(1, 10_000);
        let cloned = cb.clone();
        let _ = fail(&cb).await;
        assert_eq!(cloned.get_state().await, CircuitState::Open);

        cloned.reset().await;
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }
}
