use thiserror::Error;

/// 协调器错误类型定义
///
/// 只有威胁"单一有效认领"或消息持久性的情况才会作为错误返回；
/// 并发带来的良性竞争（重复确认、未知Worker心跳、过期释放）只记录日志。
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("消息分发失败: {0}")]
    Dispatch(String),

    #[error("熔断器已打开，拒绝调用: {component}")]
    CircuitOpen { component: String },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("数据验证失败: {0}")]
    Validation(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn dispatch<S: Into<String>>(msg: S) -> Self {
        Self::Dispatch(msg.into())
    }

    pub fn circuit_open<S: Into<String>>(component: S) -> Self {
        Self::CircuitOpen {
            component: component.into(),
        }
    }

    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }

    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 熔断拒绝与真实的下游失败需要区别对待（调用方的退避策略不同）
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CoordinatorError::CircuitOpen { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Database(_)
                | CoordinatorError::Persistence(_)
                | CoordinatorError::Dispatch(_)
                | CoordinatorError::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Internal(_) | CoordinatorError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CoordinatorError {
    fn from(err: anyhow::Error) -> Self {
        CoordinatorError::Internal(err.to_string())
    }
}
