//! Workitem engine: request validation, the saga-based orchestrator, and
//! the service turning requests into outcomes.

pub mod orchestrator;
pub mod saga;
pub mod service;
pub mod validation;

pub use orchestrator::{WorkitemOrchestrator, merge_cancellation_reason};
pub use saga::Saga;
pub use service::{WorkitemService, validate_state_change};
pub use validation::UpdatePolicy;
