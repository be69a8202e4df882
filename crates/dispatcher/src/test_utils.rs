//! 测试用的手写 mock

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use coordinator_core::{CoordinatorError, CoordinatorResult};
use coordinator_domain::{AckResult, Message, MessageStats, MessageStore, MessageTransport};

/// 可控制失败的传输
///
/// 前 `fail_first` 次投递失败；`set_failing(true)` 后所有投递都失败。
#[derive(Debug, Default)]
pub struct FlakyTransport {
    fail_first: AtomicU32,
    failing: AtomicBool,
    attempts: AtomicU32,
    delivered: RwLock<Vec<Message>>,
}

impl FlakyTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn failing_first(count: u32) -> Self {
        let transport = Self::default();
        transport.fail_first.store(count, Ordering::SeqCst);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn delivered(&self) -> Vec<Message> {
        self.delivered.read().await.clone()
    }
}

#[async_trait]
impl MessageTransport for FlakyTransport {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn deliver(&self, message: &Message) -> CoordinatorResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(CoordinatorError::dispatch("transport unavailable"));
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(CoordinatorError::dispatch("transient transport failure"));
        }

        self.delivered.write().await.push(message.clone());
        Ok(())
    }
}

/// 所有写入都失败的消息存储
#[derive(Debug, Default)]
pub struct FailingMessageStore;

impl FailingMessageStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageStore for FailingMessageStore {
    async fn initialize(&self) -> CoordinatorResult<()> {
        Ok(())
    }

    async fn close(&self) -> CoordinatorResult<()> {
        Ok(())
    }

    async fn append(&self, _message: &Message) -> CoordinatorResult<()> {
        Err(CoordinatorError::persistence("disk full"))
    }

    async fn get(&self, _message_id: &str) -> CoordinatorResult<Option<Message>> {
        Ok(None)
    }

    async fn acknowledge(
        &self,
        _message_id: &str,
        _recipient_id: &str,
    ) -> CoordinatorResult<AckResult> {
        Ok(AckResult::rejected())
    }

    async fn stats(&self) -> CoordinatorResult<MessageStats> {
        Ok(MessageStats::default())
    }
}
