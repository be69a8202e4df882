//! 内存存储实现
//!
//! 适用于测试和单进程部署；进程退出后数据丢失。

pub mod claim_store;
pub mod dead_letter_store;
pub mod message_store;

pub use claim_store::InMemoryClaimStore;
pub use dead_letter_store::InMemoryDeadLetterStore;
pub use message_store::InMemoryMessageStore;
