//! Worker pools, worker selection and pool-local auto-scaling

#[allow(clippy::module_inception)]
pub mod balancer;
pub mod pool;
pub mod strategy;
pub mod worker;

pub use balancer::LoadBalancer;
pub use pool::{PoolStats, ScaleDirection, ScalingAction, WorkerPool};
pub use strategy::SelectionStrategy;
pub use worker::{OverloadLimits, Worker, WorkerStatus};
