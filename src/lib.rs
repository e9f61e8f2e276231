pub mod actors;
pub mod alerts;
pub mod balancer;
pub mod config;
pub mod error;
pub mod monitors;
pub mod processing;
pub mod scaling;
pub mod stats;
pub mod storage;
pub mod supervisor;
pub mod util;

pub use balancer::LoadBalancer;
pub use error::{ScalingError, ScalingResult, TaskError};
pub use monitors::memory::MemoryManager;
pub use monitors::resources::ResourceMonitor;
pub use processing::ConcurrentProcessor;
pub use scaling::ScalabilityManager;
pub use storage::{DataRetentionManager, StorageAlertingService, StorageMonitor};
