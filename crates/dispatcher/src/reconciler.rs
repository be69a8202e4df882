//! 对账循环
//!
//! 按固定间隔调用 [`Coordinator::reconcile_once`]。停止信号通过 watch 通道传递，
//! 正在执行的一轮对账不会被中断。

use std::sync::Weak;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

/// 一轮对账的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// 本轮新标记为 STALE 的Worker
    pub stale_workers: Vec<String>,
    pub reassigned_tasks: Vec<String>,
    pub dead_letters_retried: usize,
    pub dead_letters_failed: usize,
    pub messages_dispatched: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.stale_workers.is_empty()
            && self.reassigned_tasks.is_empty()
            && self.dead_letters_retried == 0
            && self.dead_letters_failed == 0
            && self.messages_dispatched == 0
    }
}

pub struct Reconciler {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reconciler {
    /// 启动对账任务；协调器被释放后循环自动退出
    pub fn spawn(coordinator: Weak<Coordinator>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "启动对账循环");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成，跳过
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(coordinator) = coordinator.upgrade() else {
                            debug!("协调器已释放，退出对账循环");
                            break;
                        };
                        coordinator.reconcile_once().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("对账循环已停止");
        });

        Self { stop_tx, handle }
    }

    /// 发送停止信号并等待循环退出
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!("对账任务异常退出: {}", e);
        }
    }
}
