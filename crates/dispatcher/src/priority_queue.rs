//! 出站消息优先级队列
//!
//! 按 importance 从高到低出队，同一级别内保持到达顺序。
//! 排序只依赖 importance 和入队序号，与消息内容无关。

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::Mutex;

use coordinator_domain::{Importance, Message};

#[derive(Debug)]
struct QueuedMessage {
    importance: Importance,
    sequence: u64,
    message: Message,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.importance == other.importance && self.sequence == other.sequence
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    // BinaryHeap 是大顶堆：importance 高的优先，序号小的优先
    fn cmp(&self, other: &Self) -> Ordering {
        self.importance
            .cmp(&other.importance)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueuedMessage>,
    next_sequence: u64,
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    state: Mutex<QueueState>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, message: Message) {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(QueuedMessage {
            importance: message.importance,
            sequence,
            message,
        });
    }

    pub async fn dequeue(&self) -> Option<Message> {
        self.state.lock().await.heap.pop().map(|q| q.message)
    }

    /// 按出队顺序取出全部消息
    pub async fn drain(&self) -> Vec<Message> {
        let mut state = self.state.lock().await;
        let mut drained = Vec::with_capacity(state.heap.len());
        while let Some(queued) = state.heap.pop() {
            drained.push(queued.message);
        }
        drained
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }
}
