//! 协调器调度层
//!
//! Worker注册、任务认领、消息投递与死信重试，以及把它们串起来的 [`Coordinator`]。

pub mod coordinator;
pub mod dead_letter;
pub mod message_persistence;
pub mod priority_queue;
pub mod reconciler;
pub mod task_claim;
pub mod test_utils;
pub mod worker_registry;

pub use coordinator::{
    ClaimOptions, Coordinator, CoordinatorBuilder, CoordinatorStatus, DeadLetterStatus,
    DispatchReport, SendResult,
};
pub use dead_letter::{BackoffPolicy, DeadLetter, REASON_MAX_RETRIES_EXCEEDED};
pub use message_persistence::MessagePersistence;
pub use priority_queue::PriorityQueue;
pub use reconciler::{ReconcileReport, Reconciler};
pub use task_claim::{ClaimResult, TaskClaim};
pub use worker_registry::{WorkerCounts, WorkerRegistry};
