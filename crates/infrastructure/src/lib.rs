pub mod circuit_breaker;
pub mod database;
pub mod memory;
pub mod observability;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use database::{DatabaseManager, SqliteClaimStore, SqliteDeadLetterStore, SqliteMessageStore};
pub use memory::{InMemoryClaimStore, InMemoryDeadLetterStore, InMemoryMessageStore};
pub use observability::{MetricsCollector, TaskTrace, TaskTracer};
pub use transport::{InMemoryTransport, LoggingTransport};
