use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use coordinator_core::CoordinatorConfig;
use coordinator_dispatcher::Coordinator;
use coordinator_infrastructure::{
    DatabaseManager, LoggingTransport, SqliteClaimStore, SqliteDeadLetterStore,
    SqliteMessageStore,
};

/// 协调器进程
pub struct Application {
    coordinator: Arc<Coordinator>,
    database: Option<DatabaseManager>,
}

impl Application {
    /// 按配置的存储后端组装协调器
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        info!(
            coordinator = %config.coordinator_name,
            storage = %config.storage_backend,
            "初始化协调器"
        );

        let builder = Coordinator::builder(config.clone()).transport(Arc::new(LoggingTransport));

        let (builder, database) = match config.storage_backend.as_str() {
            "sqlite" => {
                let database = DatabaseManager::connect(&config.storage_url)
                    .await
                    .with_context(|| format!("连接数据库失败: {}", config.storage_url))?;
                database.migrate().await.context("初始化数据库表失败")?;

                let pool = database.pool().clone();
                let dead_letters = SqliteDeadLetterStore::new(pool.clone())
                    .await
                    .context("创建死信存储失败")?;
                let claims = SqliteClaimStore::new(pool.clone())
                    .await
                    .context("创建认领存储失败")?;
                let builder = builder
                    .message_store(Arc::new(SqliteMessageStore::new(pool)))
                    .dead_letter_store(Arc::new(dead_letters))
                    .claim_store(Arc::new(claims));
                (builder, Some(database))
            }
            _ => (builder, None),
        };

        let coordinator = builder.build().context("创建协调器失败")?;
        Ok(Self {
            coordinator,
            database,
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// 启动协调器并阻塞到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.coordinator.start().await.context("启动协调器失败")?;

        let _ = shutdown_rx.recv().await;
        info!("停止协调器");

        self.coordinator.stop().await.context("停止协调器失败")?;
        match self.coordinator.get_status().await {
            Ok(status) => info!(
                active_claims = status.active_claims,
                pending_tasks = status.pending_tasks,
                queued_messages = status.queued_messages,
                dead_letters = status.dead_letter.count,
                "协调器最终状态"
            ),
            Err(e) => warn!("获取协调器状态失败: {e}"),
        }

        if let Some(database) = &self.database {
            database.close().await;
        }
        Ok(())
    }
}

/// 启动 Prometheus 指标导出
pub fn install_metrics_exporter(config: &CoordinatorConfig) -> Result<()> {
    let addr: std::net::SocketAddr = config
        .metrics_listen_addr
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_listen_addr))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("启动Prometheus指标导出失败")?;

    info!("Prometheus指标导出监听于 {addr}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownManager;
    use coordinator_domain::{TaskRef, WorkerMetadata};

    #[tokio::test]
    async fn test_memory_backend_runs_until_shutdown() {
        let app = Arc::new(Application::new(CoordinatorConfig::default()).await.unwrap());
        let shutdown = ShutdownManager::new();
        let rx = shutdown.subscribe().await;

        let runner = {
            let app = app.clone();
            tokio::spawn(async move { app.run(rx).await })
        };

        app.coordinator()
            .register_worker("W1", WorkerMetadata::default())
            .await
            .unwrap();
        shutdown.shutdown().await;

        runner.await.unwrap().unwrap();
        assert!(!app.coordinator().is_running());
    }

    #[tokio::test]
    async fn test_sqlite_backend_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.db");
        let config = CoordinatorConfig {
            storage_backend: "sqlite".to_string(),
            storage_url: format!("sqlite://{}", path.display()),
            ..Default::default()
        };

        let app = Application::new(config).await.unwrap();
        assert!(path.exists());
        assert!(app.database.is_some());

        app.coordinator()
            .submit_task(TaskRef::new("T1", "task-execution"))
            .await
            .unwrap();
        assert_eq!(app.coordinator().task_claims().pending_count().await.unwrap(), 1);
    }
}
