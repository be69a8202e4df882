use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::{CoordinatorError, CoordinatorResult};

/// 协调器配置
///
/// 字段名与环境变量一一对应（小写形式），例如 `STALE_THRESHOLD_MS`
/// 覆盖 `stale_threshold_ms`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// 协调器身份，作为Worker控制消息的 recipient
    pub coordinator_name: String,
    /// 心跳超过该时长（毫秒）的Worker被标记为STALE
    pub stale_threshold_ms: u64,
    /// 对账循环间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 消息重试次数达到该值后进入死信
    pub retry_max_attempts: u32,
    /// 连续失败多少次后熔断器打开
    pub circuit_breaker_failure_threshold: u32,
    /// 熔断器打开后允许试探调用前的等待时间（毫秒）
    ///
    /// 环境变量 `CIRCUIT_BREAKER_RESET_TIMEOUT` 同样映射到该字段。
    #[serde(alias = "circuit_breaker_reset_timeout")]
    pub circuit_breaker_reset_timeout_ms: u64,
    /// 半开状态下需要连续成功多少次才关闭
    pub circuit_breaker_success_threshold: u32,
    /// 单次受保护调用的超时时间（毫秒）
    pub circuit_breaker_call_timeout_ms: u64,
    pub dead_letter_enabled: bool,
    /// 死信重试的基础延迟（毫秒）
    pub dead_letter_base_delay_ms: u64,
    /// 死信重试的最大延迟（毫秒）
    pub dead_letter_max_delay_ms: u64,
    pub dead_letter_backoff_multiplier: f64,
    /// 注册时未声明能力的Worker使用的默认能力集
    pub default_capabilities: Vec<String>,
    pub log_level: String,
    pub log_format: String,
    /// "memory" 或 "sqlite"
    pub storage_backend: String,
    pub storage_url: String,
    pub metrics_enabled: bool,
    pub metrics_listen_addr: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator_name: "coordinator".to_string(),
            stale_threshold_ms: 30_000,
            poll_interval_ms: 5_000,
            retry_max_attempts: 3,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout_ms: 30_000,
            circuit_breaker_success_threshold: 1,
            circuit_breaker_call_timeout_ms: 10_000,
            dead_letter_enabled: true,
            dead_letter_base_delay_ms: 1_000,
            dead_letter_max_delay_ms: 300_000, // 5分钟
            dead_letter_backoff_multiplier: 2.0,
            default_capabilities: vec!["task-execution".to_string()],
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            storage_backend: "memory".to_string(),
            storage_url: "sqlite://coordinator.db".to_string(),
            metrics_enabled: false,
            metrics_listen_addr: "0.0.0.0:9464".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// 从TOML文件（可选）和进程环境变量加载配置
    pub fn load(config_path: Option<&str>) -> CoordinatorResult<Self> {
        Self::load_with_env(config_path, None)
    }

    /// 与 `load` 相同，但可以注入环境变量来源（测试中使用）
    pub fn load_with_env(
        config_path: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> CoordinatorResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(CoordinatorError::config_error(format!(
                    "配置文件不存在: {path}"
                )));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::default()
                .source(env)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("default_capabilities"),
        );

        let config: CoordinatorConfig = builder
            .build()
            .map_err(|e| CoordinatorError::config_error(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| CoordinatorError::config_error(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> CoordinatorResult<Self> {
        let config: CoordinatorConfig = toml::from_str(toml_str)
            .map_err(|e| CoordinatorError::config_error(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> CoordinatorResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CoordinatorError::config_error(format!("序列化配置为TOML失败: {e}")))
    }

    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.coordinator_name.trim().is_empty() {
            return Err(CoordinatorError::config_error("coordinator_name 不能为空"));
        }
        if self.stale_threshold_ms == 0 {
            return Err(CoordinatorError::config_error(
                "stale_threshold_ms 必须大于0",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(CoordinatorError::config_error(
                "poll_interval_ms 必须大于0",
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(CoordinatorError::config_error(
                "retry_max_attempts 必须大于0",
            ));
        }
        if self.circuit_breaker_failure_threshold == 0 {
            return Err(CoordinatorError::config_error(
                "circuit_breaker_failure_threshold 必须大于0",
            ));
        }
        if self.circuit_breaker_success_threshold == 0 {
            return Err(CoordinatorError::config_error(
                "circuit_breaker_success_threshold 必须大于0",
            ));
        }
        if self.circuit_breaker_reset_timeout_ms == 0 {
            return Err(CoordinatorError::config_error(
                "circuit_breaker_reset_timeout_ms 必须大于0",
            ));
        }
        if self.circuit_breaker_call_timeout_ms == 0 {
            return Err(CoordinatorError::config_error(
                "circuit_breaker_call_timeout_ms 必须大于0",
            ));
        }
        if self.dead_letter_backoff_multiplier < 1.0 {
            return Err(CoordinatorError::config_error(
                "dead_letter_backoff_multiplier 不能小于1.0",
            ));
        }
        if self.dead_letter_base_delay_ms > self.dead_letter_max_delay_ms {
            return Err(CoordinatorError::config_error(
                "dead_letter_base_delay_ms 不能大于 dead_letter_max_delay_ms",
            ));
        }
        if !matches!(self.storage_backend.as_str(), "memory" | "sqlite") {
            return Err(CoordinatorError::config_error(format!(
                "不支持的存储后端: {}",
                self.storage_backend
            )));
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(CoordinatorError::config_error(format!(
                "不支持的日志格式: {}",
                self.log_format
            )));
        }
        crate::logging::LogLevel::parse(&self.log_level)?;
        Ok(())
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn circuit_breaker_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_reset_timeout_ms)
    }

    pub fn circuit_breaker_call_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.coordinator_name, "coordinator");
        assert_eq!(config.stale_threshold_ms, 30_000);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.default_capabilities, vec!["task-execution"]);
        assert!(config.dead_letter_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CoordinatorConfig::default();
        config.circuit_breaker_failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.storage_backend = "redis".to_string();
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.dead_letter_base_delay_ms = 10_000;
        config.dead_letter_max_delay_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms 必须大于0"));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = CoordinatorConfig::default();
        let serialized = config.to_toml().unwrap();
        let parsed = CoordinatorConfig::from_toml(&serialized).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_config_partial_toml_uses_defaults() {
        let config = CoordinatorConfig::from_toml(
            r#"
coordinator_name = "orchestrator"
stale_threshold_ms = 500
"#,
        )
        .unwrap();

        assert_eq!(config.coordinator_name, "orchestrator");
        assert_eq!(config.stale_threshold_ms, 500);
        assert_eq!(config.poll_interval_ms, 5_000);
    }

    #[test]
    fn test_load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "coordinator_name = \"from-file\"").unwrap();
        writeln!(file, "poll_interval_ms = 250").unwrap();

        let mut env = HashMap::new();
        env.insert("STALE_THRESHOLD_MS".to_string(), "1234".to_string());
        env.insert("DEAD_LETTER_ENABLED".to_string(), "false".to_string());
        env.insert(
            "DEFAULT_CAPABILITIES".to_string(),
            "task-execution,review".to_string(),
        );

        let path = file.path().to_str().unwrap().to_string();
        let config = CoordinatorConfig::load_with_env(Some(&path), Some(env)).unwrap();

        assert_eq!(config.coordinator_name, "from-file");
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.stale_threshold_ms, 1234);
        assert!(!config.dead_letter_enabled);
        assert_eq!(config.default_capabilities, vec!["task-execution", "review"]);
    }

    #[test]
    fn test_load_reset_timeout_from_env_name() {
        let mut env = HashMap::new();
        env.insert("CIRCUIT_BREAKER_RESET_TIMEOUT".to_string(), "1234".to_string());
        let config = CoordinatorConfig::load_with_env(None, Some(env)).unwrap();
        assert_eq!(config.circuit_breaker_reset_timeout_ms, 1234);

        let mut env = HashMap::new();
        env.insert("CIRCUIT_BREAKER_RESET_TIMEOUT_MS".to_string(), "4321".to_string());
        let config = CoordinatorConfig::load_with_env(None, Some(env)).unwrap();
        assert_eq!(config.circuit_breaker_reset_timeout_ms, 4321);
    }

    #[test]
    fn test_load_missing_file() {
        let result = CoordinatorConfig::load_with_env(Some("/nonexistent/coordinator.toml"), None);
        assert!(matches!(result, Err(CoordinatorError::Configuration(_))));
    }

    #[test]
    fn test_duration_helpers() {
        let config = CoordinatorConfig {
            stale_threshold_ms: 1500,
            poll_interval_ms: 20,
            ..Default::default()
        };
        assert_eq!(config.stale_threshold(), Duration::from_millis(1500));
        assert_eq!(config.poll_interval(), Duration::from_millis(20));
    }
}
