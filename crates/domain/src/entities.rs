use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use coordinator_core::{CoordinatorError, CoordinatorResult};

/// 消息协议版本
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// 消息类型（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ClaimTask,
    Heartbeat,
    TaskComplete,
    TaskFailed,
    TaskAssignment,
    StatusUpdate,
    ErrorReport,
    CoordinationRequest,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ClaimTask => "CLAIM_TASK",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::TaskComplete => "TASK_COMPLETE",
            MessageType::TaskFailed => "TASK_FAILED",
            MessageType::TaskAssignment => "TASK_ASSIGNMENT",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::ErrorReport => "ERROR_REPORT",
            MessageType::CoordinationRequest => "COORDINATION_REQUEST",
        }
    }

    pub fn parse(s: &str) -> CoordinatorResult<Self> {
        match s {
            "CLAIM_TASK" => Ok(MessageType::ClaimTask),
            "HEARTBEAT" => Ok(MessageType::Heartbeat),
            "TASK_COMPLETE" => Ok(MessageType::TaskComplete),
            "TASK_FAILED" => Ok(MessageType::TaskFailed),
            "TASK_ASSIGNMENT" => Ok(MessageType::TaskAssignment),
            "STATUS_UPDATE" => Ok(MessageType::StatusUpdate),
            "ERROR_REPORT" => Ok(MessageType::ErrorReport),
            "COORDINATION_REQUEST" => Ok(MessageType::CoordinationRequest),
            _ => Err(CoordinatorError::Serialization(format!(
                "Invalid message type: {s}"
            ))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息重要性，只影响出队顺序
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Low => "low",
            Importance::Normal => "normal",
            Importance::High => "high",
            Importance::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> CoordinatorResult<Self> {
        match s {
            "low" => Ok(Importance::Low),
            "normal" => Ok(Importance::Normal),
            "high" => Ok(Importance::High),
            // 旧协议中的 urgent 等同于 critical
            "critical" | "urgent" => Ok(Importance::Critical),
            _ => Err(CoordinatorError::Serialization(format!(
                "Invalid importance: {s}"
            ))),
        }
    }
}

/// 协调器通信的基本单元
///
/// 消息一旦持久化就不可变；重试通过 [`Message::next_attempt`] 生成新消息。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now(),
            sender: sender.into(),
            recipient: recipient.into(),
            importance: Importance::Normal,
            payload,
            correlation_id: None,
            trace_id: None,
        }
    }

    /// 构造 CLAIM_TASK 消息
    pub fn claim_task(recipient: impl Into<String>, request: &ClaimRequest) -> CoordinatorResult<Self> {
        let payload = serde_json::to_value(request)?;
        Ok(Self::new(
            MessageType::ClaimTask,
            request.worker_id.clone(),
            recipient,
            payload,
        ))
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// 在 payload 中写入 retry_count；非对象 payload 会被包装到 `data` 字段
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        if !self.payload.is_object() {
            let data = std::mem::take(&mut self.payload);
            let mut map = serde_json::Map::new();
            if !data.is_null() {
                map.insert("data".to_string(), data);
            }
            self.payload = Value::Object(map);
        }
        if let Value::Object(map) = &mut self.payload {
            map.insert("retry_count".to_string(), Value::from(retry_count));
        }
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.payload
            .get("retry_count")
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    /// 生成下一次投递尝试：新id、重试次数+1，并通过 correlation_id 指向最初的消息
    pub fn next_attempt(&self) -> Message {
        let correlation_id = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());

        Message {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            correlation_id: Some(correlation_id),
            ..self.clone()
        }
        .with_retry_count(self.retry_count().saturating_add(1))
    }

    pub fn to_json(&self) -> CoordinatorResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> CoordinatorResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// CLAIM_TASK 消息的 payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

fn default_max_tasks() -> u32 {
    1
}

impl ClaimRequest {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_tasks: 1,
            capability: None,
            task_id: None,
        }
    }

    pub fn from_message(message: &Message) -> CoordinatorResult<Self> {
        if message.message_type != MessageType::ClaimTask {
            return Err(CoordinatorError::validation_error(format!(
                "期望 CLAIM_TASK 消息，实际为 {}",
                message.message_type
            )));
        }
        let request: ClaimRequest = serde_json::from_value(message.payload.clone())?;
        if request.worker_id.trim().is_empty() {
            return Err(CoordinatorError::validation_error("worker_id 不能为空"));
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Active,
    Stale,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "ACTIVE",
            WorkerStatus::Stale => "STALE",
            WorkerStatus::Offline => "OFFLINE",
        }
    }
}

/// 注册时提供的Worker元数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub name: Option<String>,
    pub pid: Option<u32>,
    pub instance: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub name: String,
    pub pid: Option<u32>,
    pub instance: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// 心跳年龄（毫秒），时钟回拨时为0
    pub fn heartbeat_age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_milliseconds().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Claimed,
    Completed,
    Failed,
    Abandoned,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Failed => "failed",
            ClaimStatus::Abandoned => "abandoned",
        }
    }

    /// completed 和 failed 是终态
    pub fn is_final(&self) -> bool {
        matches!(self, ClaimStatus::Completed | ClaimStatus::Failed)
    }
}

/// 待认领任务的引用；任务内容对协调器是不透明的
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: String,
    pub capability: String,
    #[serde(default)]
    pub payload: Value,
    pub submitted_at: DateTime<Utc>,
}

impl TaskRef {
    pub fn new(task_id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            capability: capability.into(),
            payload: Value::Null,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// 认领台账中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub task: TaskRef,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub status: ClaimStatus,
    pub updated_at: DateTime<Utc>,
}

impl ClaimRecord {
    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn is_claimed(&self) -> bool {
        self.status == ClaimStatus::Claimed
    }
}

/// 超出重试预算的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub message: Message,
    pub reason: String,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 消息持久化的聚合统计（最终一致即可）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    pub sent: u64,
    pub acknowledged: u64,
    pub pending: u64,
    pub by_type: BTreeMap<String, u64>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// 消息确认结果；重复确认不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResult {
    pub success: bool,
    pub already_acknowledged: bool,
}

impl AckResult {
    pub fn acknowledged() -> Self {
        Self {
            success: true,
            already_acknowledged: false,
        }
    }

    pub fn duplicate() -> Self {
        Self {
            success: true,
            already_acknowledged: true,
        }
    }

    pub fn rejected() -> Self {
        Self {
            success: false,
            already_acknowledged: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_envelope_json() {
        let message = Message::new(
            MessageType::TaskComplete,
            "worker-1",
            "coordinator",
            json!({"task_id": "T1"}),
        )
        .with_importance(Importance::High);

        let json = message.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "TASK_COMPLETE");
        assert_eq!(value["importance"], "high");
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert!(value.get("correlation_id").is_none());

        let parsed = Message::from_json(&json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_next_attempt_keeps_original_immutable() {
        let original = Message::new(MessageType::StatusUpdate, "coordinator", "worker-1", json!({}));
        let retry = original.next_attempt();

        assert_eq!(original.retry_count(), 0);
        assert_eq!(retry.retry_count(), 1);
        assert_ne!(retry.id, original.id);
        assert_eq!(retry.correlation_id.as_deref(), Some(original.id.as_str()));

        // 多次重试仍然指向最初的消息
        let second = retry.next_attempt();
        assert_eq!(second.retry_count(), 2);
        assert_eq!(second.correlation_id.as_deref(), Some(original.id.as_str()));
    }

    #[test]
    fn test_with_retry_count_wraps_scalar_payload() {
        let message = Message::new(MessageType::ErrorReport, "a", "b", json!("boom")).with_retry_count(2);
        assert_eq!(message.payload["data"], "boom");
        assert_eq!(message.retry_count(), 2);
    }

    #[test]
    fn test_importance_ordering() {
        assert!(Importance::Critical > Importance::High);
        assert!(Importance::High > Importance::Normal);
        assert!(Importance::Normal > Importance::Low);
        assert_eq!(Importance::parse("urgent").unwrap(), Importance::Critical);
        assert!(Importance::parse("meh").is_err());
    }

    #[test]
    fn test_claim_request_from_message() {
        let mut request = ClaimRequest::new("worker-1");
        request.max_tasks = 3;
        let message = Message::claim_task("coordinator", &request).unwrap();

        assert_eq!(message.sender, "worker-1");
        let parsed = ClaimRequest::from_message(&message).unwrap();
        assert_eq!(parsed, request);

        let heartbeat = Message::new(MessageType::Heartbeat, "worker-1", "coordinator", json!({}));
        assert!(ClaimRequest::from_message(&heartbeat).is_err());
    }

    #[test]
    fn test_claim_request_defaults_max_tasks() {
        let message = Message::new(
            MessageType::ClaimTask,
            "worker-1",
            "coordinator",
            json!({"worker_id": "worker-1"}),
        );
        let request = ClaimRequest::from_message(&message).unwrap();
        assert_eq!(request.max_tasks, 1);
        assert!(request.task_id.is_none());
    }

    #[test]
    fn test_message_type_parse() {
        for t in [
            MessageType::ClaimTask,
            MessageType::Heartbeat,
            MessageType::TaskComplete,
            MessageType::TaskFailed,
        ] {
            assert_eq!(MessageType::parse(t.as_str()).unwrap(), t);
        }
        assert!(MessageType::parse("PING").is_err());
    }
}
