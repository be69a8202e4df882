//! 协调器门面
//!
//! 组合Worker注册表、认领台账、消息持久化、优先级队列、死信队列和熔断器，
//! 并负责对账循环的启停。所有依赖通过 [`CoordinatorBuilder`] 注入。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use coordinator_core::{CoordinatorConfig, CoordinatorError, CoordinatorResult};
use coordinator_domain::{
    AckResult, ClaimRequest, ClaimStatus, ClaimStore, DeadLetterStore, Importance, Message, MessageStats,
    MessageStore, MessageTransport, MessageType, SpanAttributes, SpanStatus, TaskRef,
    TraceBackend, TraceContext, WorkerInfo, WorkerMetadata, WorkerStatus,
};
use coordinator_infrastructure::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, InMemoryClaimStore,
    InMemoryDeadLetterStore, InMemoryMessageStore, InMemoryTransport, MetricsCollector,
    TaskTracer,
};

use crate::dead_letter::{BackoffPolicy, DeadLetter, REASON_MAX_RETRIES_EXCEEDED};
use crate::message_persistence::MessagePersistence;
use crate::priority_queue::PriorityQueue;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::task_claim::{ClaimResult, TaskClaim};
use crate::worker_registry::{WorkerCounts, WorkerRegistry};

const BREAKER_NAME: &str = "coordinator";

/// `claim_task` 的可选参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimOptions {
    pub max_tasks: Option<u32>,
    pub capability: Option<String>,
    pub task_id: Option<String>,
}

impl ClaimOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_tasks(mut self, max_tasks: u32) -> Self {
        self.max_tasks = Some(max_tasks);
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// `send_message` 的结果
///
/// 超过重试上限不是错误：返回 `success: false` 和 `dead_letter: true`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dead_letter: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_id: Option<String>,
}

impl SendResult {
    fn sent(message_id: String) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
            dead_letter: false,
            dead_letter_id: None,
        }
    }

    fn failed(message_id: String, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id,
            error: Some(error.into()),
            dead_letter: false,
            dead_letter_id: None,
        }
    }

    fn dead_lettered(message_id: String, error: impl Into<String>, entry_id: String) -> Self {
        Self {
            success: false,
            message_id,
            error: Some(error.into()),
            dead_letter: true,
            dead_letter_id: Some(entry_id),
        }
    }
}

/// 一次队列刷新的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub delivered: usize,
    /// 投递失败、以新的重试消息重新入队
    pub requeued: usize,
    pub dead_lettered: usize,
    /// 熔断打开或持久化失败，原样放回队列
    pub deferred: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStatus {
    pub enabled: bool,
    pub count: u64,
}

/// 协调器状态快照
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub coordinator_name: String,
    pub workers: WorkerCounts,
    pub active_claims: usize,
    pub pending_tasks: usize,
    pub queued_messages: usize,
    pub messages: MessageStats,
    pub dead_letter: DeadLetterStatus,
    pub circuit_breaker: CircuitBreakerStats,
    pub open_traces: usize,
    pub config: CoordinatorConfig,
}

struct TaskTraceEntry {
    trace: Arc<dyn TraceContext>,
    span_id: String,
    worker_id: String,
}

fn attributes<const N: usize>(pairs: [(&str, String); N]) -> SpanAttributes {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    message_store: Option<Arc<dyn MessageStore>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    claim_store: Option<Arc<dyn ClaimStore>>,
    transport: Option<Arc<dyn MessageTransport>>,
    tracer: Option<Arc<dyn TraceBackend>>,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            message_store: None,
            dead_letter_store: None,
            claim_store: None,
            transport: None,
            tracer: None,
        }
    }

    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn claim_store(mut self, store: Arc<dyn ClaimStore>) -> Self {
        self.claim_store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn TraceBackend>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// 校验配置并组装协调器；未注入的依赖使用内存实现
    pub fn build(self) -> CoordinatorResult<Arc<Coordinator>> {
        self.config.validate()?;
        let config = self.config;

        let registry = Arc::new(WorkerRegistry::new(config.default_capabilities.clone()));
        let claim_store = self
            .claim_store
            .unwrap_or_else(|| Arc::new(InMemoryClaimStore::new()));
        let claims = TaskClaim::new(registry.clone(), claim_store);
        let message_store = self
            .message_store
            .unwrap_or_else(|| Arc::new(InMemoryMessageStore::new()));
        let dead_letter_store = self
            .dead_letter_store
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new()));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryTransport::new()));
        let tracer = self
            .tracer
            .unwrap_or_else(|| Arc::new(TaskTracer::new(config.coordinator_name.clone())));
        let breaker = CircuitBreaker::with_config(
            BREAKER_NAME,
            CircuitBreakerConfig::from_coordinator_config(&config),
        );
        let dead_letter = DeadLetter::new(dead_letter_store, BackoffPolicy::from_config(&config));

        Ok(Arc::new(Coordinator {
            registry,
            claims,
            persistence: MessagePersistence::new(message_store),
            queue: PriorityQueue::new(),
            dead_letter,
            breaker,
            transport,
            tracer,
            metrics: MetricsCollector::new(),
            task_traces: Mutex::new(HashMap::new()),
            reconciler: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            config,
        }))
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    claims: TaskClaim,
    persistence: MessagePersistence,
    queue: PriorityQueue,
    dead_letter: DeadLetter,
    breaker: CircuitBreaker,
    transport: Arc<dyn MessageTransport>,
    tracer: Arc<dyn TraceBackend>,
    metrics: MetricsCollector,
    task_traces: Mutex<HashMap<String, TaskTraceEntry>>,
    reconciler: tokio::sync::Mutex<Option<Reconciler>>,
    running: AtomicBool,
}

impl Coordinator {
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn task_claims(&self) -> &TaskClaim {
        &self.claims
    }

    pub fn dead_letters(&self) -> &DeadLetter {
        &self.dead_letter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- 生命周期 ----

    /// 初始化持久化和追踪后端并启动对账循环；重复启动只记录警告
    pub async fn start(self: &Arc<Self>) -> CoordinatorResult<()> {
        let mut reconciler = self.reconciler.lock().await;
        if self.running.load(Ordering::SeqCst) {
            warn!(coordinator = %self.config.coordinator_name, "协调器已在运行，忽略重复启动");
            return Ok(());
        }

        self.persistence.initialize().await?;
        self.tracer.initialize().await?;
        *reconciler = Some(Reconciler::spawn(
            Arc::downgrade(self),
            self.config.poll_interval(),
        ));
        self.running.store(true, Ordering::SeqCst);

        info!(
            coordinator = %self.config.coordinator_name,
            transport = self.transport.name(),
            poll_interval_ms = self.config.poll_interval_ms,
            "协调器已启动"
        );
        Ok(())
    }

    /// 停止对账循环并释放资源；进行中的操作不会被取消
    pub async fn stop(&self) -> CoordinatorResult<()> {
        let mut reconciler = self.reconciler.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("协调器未运行，忽略停止请求");
            return Ok(());
        }

        if let Some(handle) = reconciler.take() {
            handle.shutdown().await;
        }
        self.persistence.close().await?;
        self.tracer.close().await?;

        info!(coordinator = %self.config.coordinator_name, "协调器已停止");
        Ok(())
    }

    // ---- Worker ----

    pub async fn register_worker(
        &self,
        worker_id: &str,
        metadata: WorkerMetadata,
    ) -> CoordinatorResult<WorkerInfo> {
        self.registry.register(worker_id, metadata).await
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> CoordinatorResult<()> {
        self.registry.unregister(worker_id).await
    }

    /// 返回心跳是否被接受
    pub async fn send_heartbeat(&self, worker_id: &str) -> bool {
        self.registry.update_heartbeat(worker_id).await
    }

    // ---- 任务 ----

    pub async fn submit_task(&self, task: TaskRef) -> CoordinatorResult<()> {
        self.claims.submit(task).await
    }

    /// 认领任务
    ///
    /// 每次认领打开一条 trace；认领成功的任务在完成或失败前保持一个 `task.claimed` span。
    pub async fn claim_task(
        &self,
        worker_id: &str,
        options: ClaimOptions,
    ) -> CoordinatorResult<ClaimResult> {
        if worker_id.trim().is_empty() {
            return Err(CoordinatorError::validation_error("worker_id 不能为空"));
        }

        let request = ClaimRequest {
            worker_id: worker_id.to_string(),
            max_tasks: options.max_tasks.unwrap_or(1).max(1),
            capability: options.capability,
            task_id: options.task_id,
        };

        let trace = self.tracer.create_trace(
            "task.claim",
            attributes([("worker.id", worker_id.to_string())]),
        );
        let claim_span = trace.start_span(
            "claim",
            attributes([("max_tasks", request.max_tasks.to_string())]),
        );
        let message = Message::claim_task(self.config.coordinator_name.clone(), &request)?
            .with_trace_id(trace.trace_id());

        let claims = &self.claims;
        let outcome = self.breaker.execute(|| claims.claim(&message)).await;

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                trace.end_span(
                    &claim_span,
                    SpanStatus::Error,
                    attributes([("error", e.to_string())]),
                );
                trace.finish();
                let reason = if e.is_circuit_open() { "circuit_open" } else { "error" };
                self.metrics.record_claim_rejected(reason);
                warn!(worker_id, error = %e, "认领任务失败");
                return Err(e);
            }
        };

        if result.success {
            trace.end_span(
                &claim_span,
                SpanStatus::Ok,
                attributes([("task_ids", result.task_ids.join(","))]),
            );
            for task_id in &result.task_ids {
                let span_id = trace.start_span(
                    "task.claimed",
                    attributes([
                        ("task.id", task_id.clone()),
                        ("worker.id", worker_id.to_string()),
                    ]),
                );
                self.track_task(
                    task_id,
                    TaskTraceEntry {
                        trace: trace.clone(),
                        span_id,
                        worker_id: worker_id.to_string(),
                    },
                );
            }
            self.metrics.record_claims_granted(result.task_ids.len());
        } else {
            let reason = result.reason.clone().unwrap_or_default();
            trace.end_span(&claim_span, SpanStatus::Ok, attributes([("reason", reason.clone())]));
            trace.finish();
            self.metrics.record_claim_rejected(&reason);
        }

        result.trace_id = Some(trace.trace_id().to_string());
        Ok(result)
    }

    /// 完成任务；返回 false 表示认领已不属于该Worker，此时不发送任何消息
    pub async fn complete_task(
        &self,
        worker_id: &str,
        task_id: &str,
        result: Value,
    ) -> CoordinatorResult<bool> {
        self.finish_task(
            worker_id,
            task_id,
            ClaimStatus::Completed,
            json!({ "task_id": task_id, "result": result }),
        )
        .await
    }

    pub async fn fail_task(
        &self,
        worker_id: &str,
        task_id: &str,
        error: &str,
    ) -> CoordinatorResult<bool> {
        self.finish_task(
            worker_id,
            task_id,
            ClaimStatus::Failed,
            json!({ "task_id": task_id, "error": error }),
        )
        .await
    }

    /// 释放认领后发送结束消息
    ///
    /// 消息未能持久化时认领恢复为 claimed 并返回错误，调用方可以重试；
    /// trace 也保持打开。
    async fn finish_task(
        &self,
        worker_id: &str,
        task_id: &str,
        status: ClaimStatus,
        payload: Value,
    ) -> CoordinatorResult<bool> {
        if !self.claims.release(task_id, worker_id, status).await? {
            return Ok(false);
        }

        let (message_type, outcome) = match status {
            ClaimStatus::Failed => (MessageType::TaskFailed, "failed"),
            _ => (MessageType::TaskComplete, "completed"),
        };
        let mut message = Message::new(
            message_type,
            worker_id,
            self.config.coordinator_name.clone(),
            payload,
        );
        if message_type == MessageType::TaskFailed {
            message = message.with_importance(Importance::High);
        }
        if let Some(trace_id) = self.task_trace_id(task_id) {
            message = message.with_trace_id(trace_id);
        }

        if let Err(e) = self.send_message(message).await {
            match self.claims.restore(task_id, worker_id, status).await {
                Ok(true) => {
                    warn!(worker_id, task_id, error = %e, "任务结束消息发送失败，认领已恢复")
                }
                Ok(false) => error!(
                    worker_id,
                    task_id,
                    error = %e,
                    "任务结束消息发送失败，认领已被修改，无法恢复"
                ),
                Err(restore_err) => error!(
                    worker_id,
                    task_id,
                    error = %e,
                    restore_error = %restore_err,
                    "任务结束消息发送失败，恢复认领也失败"
                ),
            }
            return Err(e);
        }

        let span_status = match status {
            ClaimStatus::Completed => SpanStatus::Ok,
            _ => SpanStatus::Error,
        };
        self.close_task_trace(
            task_id,
            span_status,
            attributes([("outcome", outcome.to_string())]),
        );
        self.metrics.record_task_finished(outcome);
        info!(worker_id, task_id, outcome, "任务已结束");
        Ok(true)
    }

    // ---- 消息 ----

    /// 持久化并入队出站消息
    ///
    /// 持久化完成后才返回成功。重试次数已达上限的消息直接进入死信。
    pub async fn send_message(&self, message: Message) -> CoordinatorResult<SendResult> {
        let retry_count = message.retry_count();
        if retry_count >= self.config.retry_max_attempts {
            if !self.config.dead_letter_enabled {
                warn!(
                    message_id = %message.id,
                    retry_count,
                    "消息超过最大重试次数且死信未启用，拒绝发送"
                );
                return Ok(SendResult::failed(message.id, REASON_MAX_RETRIES_EXCEEDED));
            }

            let entry = self
                .dead_letter
                .store(&message, REASON_MAX_RETRIES_EXCEEDED)
                .await?;
            self.metrics.record_dead_lettered(REASON_MAX_RETRIES_EXCEEDED);
            return Ok(SendResult::dead_lettered(
                message.id,
                REASON_MAX_RETRIES_EXCEEDED,
                entry.id,
            ));
        }

        let message_id = message.id.clone();
        let message_type = message.message_type;
        let persistence = &self.persistence;
        let queue = &self.queue;
        self.breaker
            .execute(|| async move {
                persistence.store_outgoing(&message).await?;
                queue.enqueue(message).await;
                Ok::<_, CoordinatorError>(())
            })
            .await?;

        self.metrics.record_message_sent(message_type.as_str());
        debug!(message_id = %message_id, message_type = %message_type, "消息已入队");
        Ok(SendResult::sent(message_id))
    }

    /// 按优先级投递队列中的全部消息
    pub async fn dispatch_pending(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut pending = self.queue.drain().await.into_iter();

        while let Some(message) = pending.next() {
            let transport = &self.transport;
            let outcome = self.breaker.execute(|| transport.deliver(&message)).await;

            match outcome {
                Ok(()) => {
                    report.delivered += 1;
                    self.metrics.record_message_delivered(message.message_type.as_str());
                }
                Err(e) if e.is_circuit_open() => {
                    // 熔断打开时本轮剩余消息原样放回队列
                    report.deferred += 1;
                    self.queue.enqueue(message).await;
                    for rest in pending.by_ref() {
                        report.deferred += 1;
                        self.queue.enqueue(rest).await;
                    }
                    debug!(deferred = report.deferred, "熔断器打开，推迟投递");
                    break;
                }
                Err(e) => self.handle_delivery_failure(message, &e, &mut report).await,
            }
        }

        self.metrics.update_queue_depth(self.queue.len().await);
        report
    }

    async fn handle_delivery_failure(
        &self,
        message: Message,
        error: &CoordinatorError,
        report: &mut DispatchReport,
    ) {
        let next = message.next_attempt();
        let retry_count = next.retry_count();
        self.metrics
            .record_delivery_failure(message.message_type.as_str(), retry_count);
        warn!(
            message_id = %message.id,
            retry_id = %next.id,
            retry_count,
            error = %error,
            "消息投递失败"
        );

        if retry_count >= self.config.retry_max_attempts {
            if !self.config.dead_letter_enabled {
                error!(message_id = %message.id, "消息超过最大重试次数且死信未启用，丢弃");
                report.dropped += 1;
                return;
            }
            match self.dead_letter.store(&next, REASON_MAX_RETRIES_EXCEEDED).await {
                Ok(_) => {
                    report.dead_lettered += 1;
                    self.metrics.record_dead_lettered(REASON_MAX_RETRIES_EXCEEDED);
                }
                Err(e) => {
                    error!(message_id = %next.id, error = %e, "写入死信失败，消息放回队列");
                    report.deferred += 1;
                    self.queue.enqueue(message).await;
                }
            }
            return;
        }

        match self.persistence.store_outgoing(&next).await {
            Ok(()) => {
                report.requeued += 1;
                self.queue.enqueue(next).await;
            }
            Err(e) => {
                error!(message_id = %next.id, error = %e, "持久化重试消息失败，原消息放回队列");
                report.deferred += 1;
                self.queue.enqueue(message).await;
            }
        }
    }

    /// 重新投递死信消息
    ///
    /// 生成新的投递尝试并直接投递，不检查重试上限；
    /// 失败时达到上限的尝试重新进入死信，否则进入普通队列。
    pub async fn retry_dead_letter(&self, message: &Message) -> CoordinatorResult<SendResult> {
        let next = message.next_attempt();
        let retry_count = next.retry_count();
        let persistence = &self.persistence;
        let transport = &self.transport;

        self.breaker
            .execute(|| persistence.store_outgoing(&next))
            .await?;
        self.metrics.record_message_sent(next.message_type.as_str());

        let outcome = self.breaker.execute(|| transport.deliver(&next)).await;
        match outcome {
            Ok(()) => {
                info!(
                    message_id = %next.id,
                    correlation_id = ?next.correlation_id,
                    retry_count,
                    "死信消息重新投递成功"
                );
                self.metrics.record_message_delivered(next.message_type.as_str());
                self.metrics.record_dead_letter_retry(true);
                Ok(SendResult::sent(next.id))
            }
            Err(e) => {
                self.metrics.record_dead_letter_retry(false);
                warn!(message_id = %next.id, retry_count, error = %e, "死信消息重新投递失败");

                if retry_count >= self.config.retry_max_attempts && self.config.dead_letter_enabled {
                    let entry = self
                        .dead_letter
                        .store(&next, REASON_MAX_RETRIES_EXCEEDED)
                        .await?;
                    self.metrics.record_dead_lettered(REASON_MAX_RETRIES_EXCEEDED);
                    Ok(SendResult::dead_lettered(next.id, e.to_string(), entry.id))
                } else {
                    let message_id = next.id.clone();
                    self.queue.enqueue(next).await;
                    Ok(SendResult::failed(message_id, e.to_string()))
                }
            }
        }
    }

    pub async fn acknowledge_message(
        &self,
        message_id: &str,
        recipient_id: &str,
    ) -> CoordinatorResult<AckResult> {
        let result = self.persistence.acknowledge(message_id, recipient_id).await?;
        if result.success {
            self.metrics
                .record_message_acknowledged(result.already_acknowledged);
        }
        Ok(result)
    }

    // ---- 对账 ----

    /// 执行一轮对账：标记超时Worker、回收其任务、重试到期死信、刷新消息队列
    ///
    /// 每个阶段自行记录并吞掉错误，一轮失败不影响下一轮。
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let started = Instant::now();
        let mut report = ReconcileReport::default();

        self.mark_stale_workers(&mut report).await;
        self.reassign_abandoned_tasks(&mut report).await;
        if self.config.dead_letter_enabled {
            self.retry_due_dead_letters(&mut report).await;
        }
        report.messages_dispatched = self.dispatch_pending().await.delivered;

        let counts = self.registry.counts().await;
        self.metrics
            .update_worker_counts(counts.active, counts.stale, counts.offline);
        self.metrics
            .update_circuit_state(self.breaker.name(), self.breaker.get_state().await);
        if let Ok(active) = self.claims.active_claim_count().await {
            self.metrics.update_active_claims(active);
        }
        self.metrics
            .record_reconcile_duration(started.elapsed().as_secs_f64());

        if report.is_empty() {
            debug!("对账完成，无变化");
        } else {
            info!(
                stale_workers = report.stale_workers.len(),
                reassigned_tasks = report.reassigned_tasks.len(),
                dead_letters_retried = report.dead_letters_retried,
                dead_letters_failed = report.dead_letters_failed,
                messages_dispatched = report.messages_dispatched,
                "对账完成"
            );
        }
        report
    }

    async fn mark_stale_workers(&self, report: &mut ReconcileReport) {
        let stale = self
            .registry
            .find_stale_workers(self.config.stale_threshold_ms)
            .await;

        for worker in stale.into_iter().filter(|w| w.status == WorkerStatus::Active) {
            match self.registry.update_status(&worker.id, WorkerStatus::Stale).await {
                Ok(()) => {
                    warn!(
                        worker_id = %worker.id,
                        last_heartbeat = %worker.last_heartbeat,
                        "Worker心跳超时，标记为STALE"
                    );
                    report.stale_workers.push(worker.id);
                }
                Err(e) => error!(worker_id = %worker.id, error = %e, "标记STALE失败"),
            }
        }
    }

    async fn reassign_abandoned_tasks(&self, report: &mut ReconcileReport) {
        let inactive: Vec<WorkerInfo> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Active)
            .collect();

        for worker in inactive {
            let tasks = match self.claims.get_abandoned_tasks(&worker.id).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(worker_id = %worker.id, error = %e, "查询被放弃的任务失败");
                    continue;
                }
            };

            for task in tasks {
                match self.claims.mark_for_reassignment(&task.task_id).await {
                    Ok(true) => {
                        self.close_task_trace(
                            &task.task_id,
                            SpanStatus::Error,
                            attributes([("outcome", "abandoned".to_string())]),
                        );
                        info!(
                            task_id = %task.task_id,
                            worker_id = %worker.id,
                            status = worker.status.as_str(),
                            "任务已回收，等待重新分配"
                        );
                        report.reassigned_tasks.push(task.task_id);
                    }
                    Ok(false) => {}
                    Err(e) => error!(task_id = %task.task_id, error = %e, "标记重新分配失败"),
                }
            }
        }
        self.metrics.record_reassignments(report.reassigned_tasks.len());
    }

    async fn retry_due_dead_letters(&self, report: &mut ReconcileReport) {
        let due = match self.dead_letter.get_due_for_retry().await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "查询到期死信失败");
                return;
            }
        };

        for entry in due {
            // 先推迟下次重试时间，避免重试过程中崩溃导致热循环
            if let Err(e) = self
                .dead_letter
                .update_retry_count(&entry.id, entry.retry_count.saturating_add(1))
                .await
            {
                error!(entry_id = %entry.id, error = %e, "更新死信重试次数失败");
                report.dead_letters_failed += 1;
                continue;
            }

            // 本次尝试的重试次数与条目更新后的计数一致，未执行的重试同样计数
            let message = entry.message.clone().with_retry_count(entry.retry_count);
            match self.retry_dead_letter(&message).await {
                Ok(result) => {
                    if result.success {
                        report.dead_letters_retried += 1;
                    } else {
                        report.dead_letters_failed += 1;
                    }
                    // 成功时条目完成使命；失败时新的尝试已单独入库
                    if let Err(e) = self.dead_letter.remove(&entry.id).await {
                        error!(entry_id = %entry.id, error = %e, "移除死信条目失败");
                    }
                }
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "死信重试未执行，保留条目");
                    report.dead_letters_failed += 1;
                }
            }
        }
    }

    // ---- 状态 ----

    pub async fn get_status(&self) -> CoordinatorResult<CoordinatorStatus> {
        Ok(CoordinatorStatus {
            running: self.is_running(),
            coordinator_name: self.config.coordinator_name.clone(),
            workers: self.registry.counts().await,
            active_claims: self.claims.active_claim_count().await?,
            pending_tasks: self.claims.pending_count().await?,
            queued_messages: self.queue.len().await,
            messages: self.persistence.get_stats().await?,
            dead_letter: DeadLetterStatus {
                enabled: self.config.dead_letter_enabled,
                count: self.dead_letter.count().await?,
            },
            circuit_breaker: self.breaker.get_stats().await,
            open_traces: self.open_trace_count(),
            config: self.config.clone(),
        })
    }

    // ---- trace 簿记 ----

    fn traces(&self) -> MutexGuard<'_, HashMap<String, TaskTraceEntry>> {
        self.task_traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task_trace_id(&self, task_id: &str) -> Option<String> {
        self.traces()
            .get(task_id)
            .map(|entry| entry.trace.trace_id().to_string())
    }

    /// 仍有任务在进行中的 trace 数量
    pub fn open_trace_count(&self) -> usize {
        let traces = self.traces();
        let mut ids: Vec<&str> = traces.values().map(|e| e.trace.trace_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    fn track_task(&self, task_id: &str, entry: TaskTraceEntry) {
        let mut traces = self.traces();
        if let Some(previous) = traces.insert(task_id.to_string(), entry) {
            let reassigned = attributes([
                ("outcome", "reassigned".to_string()),
                ("previous_worker.id", previous.worker_id.clone()),
            ]);
            Self::end_entry(&traces, previous, SpanStatus::Error, reassigned);
        }
    }

    fn close_task_trace(&self, task_id: &str, status: SpanStatus, attrs: SpanAttributes) {
        let mut traces = self.traces();
        if let Some(entry) = traces.remove(task_id) {
            Self::end_entry(&traces, entry, status, attrs);
        }
    }

    // 同一次认领的多个任务共享 trace，最后一个任务结束时才 finish
    fn end_entry(
        remaining: &HashMap<String, TaskTraceEntry>,
        entry: TaskTraceEntry,
        status: SpanStatus,
        attrs: SpanAttributes,
    ) {
        entry.trace.end_span(&entry.span_id, status, attrs);
        let trace_id = entry.trace.trace_id();
        if !remaining.values().any(|e| e.trace.trace_id() == trace_id) {
            entry.trace.finish();
        }
    }
}
