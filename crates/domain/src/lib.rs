pub mod entities;
pub mod messaging;
pub mod repositories;
pub mod telemetry;

pub use coordinator_core::{CoordinatorError, CoordinatorResult};
pub use entities::*;
pub use messaging::*;
pub use repositories::*;
pub use telemetry::*;
