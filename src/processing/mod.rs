//! Task submission, prioritized dispatch and execution

pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod task;

pub use processor::{ConcurrentProcessor, HealthReport, ProcessingStats, ShutdownReport};
pub use queue::TaskQueue;
pub use rate_limit::RateLimiter;
pub use task::{Task, TaskHandler, TaskId, TaskPriority, TaskSpec, TaskStatus};
