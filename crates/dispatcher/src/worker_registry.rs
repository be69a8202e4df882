use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use coordinator_core::{CoordinatorError, CoordinatorResult};
use coordinator_domain::{WorkerInfo, WorkerMetadata, WorkerStatus};

/// 各状态的Worker数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub total: usize,
    pub active: usize,
    pub stale: usize,
    pub offline: usize,
}

/// Worker注册表
///
/// 注销只把状态置为 OFFLINE，不删除记录。
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
    default_capabilities: Vec<String>,
}

impl WorkerRegistry {
    pub fn new(default_capabilities: Vec<String>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            default_capabilities,
        }
    }

    /// 注册Worker；重复注册会覆盖元数据并把状态重置为 ACTIVE
    pub async fn register(
        &self,
        worker_id: &str,
        metadata: WorkerMetadata,
    ) -> CoordinatorResult<WorkerInfo> {
        if worker_id.trim().is_empty() {
            return Err(CoordinatorError::validation_error("worker_id 不能为空"));
        }

        let capabilities: BTreeSet<String> = if metadata.capabilities.is_empty() {
            self.default_capabilities.iter().cloned().collect()
        } else {
            metadata.capabilities.into_iter().collect()
        };

        let now = Utc::now();
        let mut workers = self.workers.write().await;
        let registered_at = workers
            .get(worker_id)
            .map(|existing| existing.registered_at)
            .unwrap_or(now);
        let previous = workers.get(worker_id).map(|w| w.status);

        let worker = WorkerInfo {
            id: worker_id.to_string(),
            name: metadata.name.unwrap_or_else(|| worker_id.to_string()),
            pid: metadata.pid,
            instance: metadata.instance,
            capabilities,
            status: WorkerStatus::Active,
            last_heartbeat: now,
            registered_at,
        };
        workers.insert(worker_id.to_string(), worker.clone());

        match previous {
            Some(status) => info!(
                worker_id,
                previous = status.as_str(),
                "Worker重新注册"
            ),
            None => info!(worker_id, capabilities = ?worker.capabilities, "Worker注册成功"),
        }
        Ok(worker)
    }

    pub async fn unregister(&self, worker_id: &str) -> CoordinatorResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| CoordinatorError::worker_not_found(worker_id))?;

        worker.status = WorkerStatus::Offline;
        info!(worker_id, "Worker已注销");
        Ok(())
    }

    /// 记录心跳，返回是否被接受
    ///
    /// 未知Worker的心跳只记录日志：心跳可能先于注册到达。
    /// STALE 的Worker收到心跳后恢复为 ACTIVE；OFFLINE 的Worker必须重新注册。
    pub async fn update_heartbeat(&self, worker_id: &str) -> bool {
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(worker_id) else {
            warn!(worker_id, "收到未知Worker的心跳，忽略");
            return false;
        };

        match worker.status {
            WorkerStatus::Offline => {
                warn!(worker_id, "收到已注销Worker的心跳，忽略");
                false
            }
            WorkerStatus::Stale => {
                worker.last_heartbeat = Utc::now();
                worker.status = WorkerStatus::Active;
                info!(worker_id, "Worker心跳恢复，状态从STALE恢复为ACTIVE");
                true
            }
            WorkerStatus::Active => {
                worker.last_heartbeat = Utc::now();
                debug!(worker_id, "更新Worker心跳");
                true
            }
        }
    }

    /// 查找心跳超时的Worker（不修改状态）
    pub async fn find_stale_workers(&self, threshold_ms: u64) -> Vec<WorkerInfo> {
        self.find_stale_workers_at(threshold_ms, Utc::now()).await
    }

    pub async fn find_stale_workers_at(
        &self,
        threshold_ms: u64,
        now: DateTime<Utc>,
    ) -> Vec<WorkerInfo> {
        let threshold = i64::try_from(threshold_ms).unwrap_or(i64::MAX);
        let mut stale: Vec<WorkerInfo> = self
            .workers
            .read()
            .await
            .values()
            .filter(|w| w.status != WorkerStatus::Offline && w.heartbeat_age_ms(now) > threshold)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.id.cmp(&b.id));
        stale
    }

    pub async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> CoordinatorResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| CoordinatorError::worker_not_found(worker_id))?;

        if worker.status != status {
            info!(
                worker_id,
                from = worker.status.as_str(),
                to = status.as_str(),
                "Worker状态变更"
            );
            worker.status = status;
        }
        Ok(())
    }

    pub async fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.read().await.get(worker_id).cloned()
    }

    pub async fn list(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// 所有Worker当前状态的快照
    pub async fn status_snapshot(&self) -> HashMap<String, WorkerStatus> {
        self.workers
            .read()
            .await
            .iter()
            .map(|(id, worker)| (id.clone(), worker.status))
            .collect()
    }

    pub async fn counts(&self) -> WorkerCounts {
        let workers = self.workers.read().await;
        let mut counts = WorkerCounts {
            total: workers.len(),
            ..Default::default()
        };
        for worker in workers.values() {
            match worker.status {
                WorkerStatus::Active => counts.active += 1,
                WorkerStatus::Stale => counts.stale += 1,
                WorkerStatus::Offline => counts.offline += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(vec!["task-execution".to_string()])
    }

    #[tokio::test]
    async fn test_register_applies_default_capabilities() {
        let registry = registry();
        let worker = registry
            .register("W1", WorkerMetadata::default())
            .await
            .unwrap();

        assert_eq!(worker.status, WorkerStatus::Active);
        assert_eq!(worker.name, "W1");
        assert!(worker.has_capability("task-execution"));
    }

    #[tokio::test]
    async fn test_register_rejects_empty_id() {
        let registry = registry();
        let result = registry.register("  ", WorkerMetadata::default()).await;
        assert!(matches!(result, Err(CoordinatorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_reregister_overwrites_metadata_and_resets_status() {
        let registry = registry();
        let first = registry.register("W1", WorkerMetadata::default()).await.unwrap();
        registry.unregister("W1").await.unwrap();

        let metadata = WorkerMetadata {
            name: Some("builder".to_string()),
            pid: Some(4242),
            instance: Some("host-a".to_string()),
            capabilities: vec!["review".to_string()],
        };
        let second = registry.register("W1", metadata).await.unwrap();

        assert_eq!(second.status, WorkerStatus::Active);
        assert_eq!(second.name, "builder");
        assert_eq!(second.pid, Some(4242));
        assert!(second.has_capability("review"));
        assert!(!second.has_capability("task-execution"));
        assert_eq!(second.registered_at, first.registered_at);
    }

    #[tokio::test]
    async fn test_unregister_keeps_history() {
        let registry = registry();
        registry.register("W1", WorkerMetadata::default()).await.unwrap();
        registry.unregister("W1").await.unwrap();

        let worker = registry.get("W1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);
        assert_eq!(registry.list().await.len(), 1);

        assert!(matches!(
            registry.unregister("ghost").await,
            Err(CoordinatorError::WorkerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker_is_ignored() {
        let registry = registry();
        assert!(!registry.update_heartbeat("ghost").await);
        assert!(registry.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_reactivates_stale_but_not_offline() {
        let registry = registry();
        registry.register("W1", WorkerMetadata::default()).await.unwrap();
        registry.register("W2", WorkerMetadata::default()).await.unwrap();

        registry.update_status("W1", WorkerStatus::Stale).await.unwrap();
        assert!(registry.update_heartbeat("W1").await);
        assert_eq!(registry.get("W1").await.unwrap().status, WorkerStatus::Active);

        registry.unregister("W2").await.unwrap();
        assert!(!registry.update_heartbeat("W2").await);
        assert_eq!(registry.get("W2").await.unwrap().status, WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn test_find_stale_workers_is_pure() {
        let registry = registry();
        registry.register("W1", WorkerMetadata::default()).await.unwrap();
        registry.register("W2", WorkerMetadata::default()).await.unwrap();
        registry.register("W3", WorkerMetadata::default()).await.unwrap();
        registry.unregister("W3").await.unwrap();

        let later = Utc::now() + Duration::milliseconds(1_001);
        let stale = registry.find_stale_workers_at(1_000, later).await;
        let ids: Vec<&str> = stale.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["W1", "W2"]);

        // 查询不改变状态
        assert_eq!(registry.get("W1").await.unwrap().status, WorkerStatus::Active);

        let fresh = registry.find_stale_workers_at(60_000, later).await;
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_counts() {
        let registry = registry();
        registry.register("W1", WorkerMetadata::default()).await.unwrap();
        registry.register("W2", WorkerMetadata::default()).await.unwrap();
        registry.register("W3", WorkerMetadata::default()).await.unwrap();
        registry.update_status("W2", WorkerStatus::Stale).await.unwrap();
        registry.unregister("W3").await.unwrap();

        let counts = registry.counts().await;
        assert_eq!(
            counts,
            WorkerCounts {
                total: 3,
                active: 1,
                stale: 1,
                offline: 1
            }
        );
        assert!(matches!(
            registry.update_status("ghost", WorkerStatus::Active).await,
            Err(CoordinatorError::WorkerNotFound { .. })
        ));
    }
}
