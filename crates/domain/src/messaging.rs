use async_trait::async_trait;

use crate::entities::Message;
use coordinator_core::CoordinatorResult;

/// 消息的物理传输通道（HTTP、队列、共享文件……）
///
/// 返回错误表示本次投递失败，由协调器决定重试或转入死信。
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, message: &Message) -> CoordinatorResult<()>;
}
