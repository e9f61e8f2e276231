//! Storage monitoring, history persistence, retention and alerting
//!
//! ## Backends
//!
//! Usage history and cleanup runs go through the [`StorageBackend`] trait:
//!
//! - **SQLite** (default, `storage-sqlite` feature): embedded database with
//!   migrations under `migrations/`
//! - **In-memory**: bounded buffers, nothing survives a restart
//!
//! ## Components
//!
//! - [`StorageMonitor`] samples monitored paths and raises disk alerts
//! - [`DataRetentionManager`] turns retention policies into cleanup actions
//! - [`StorageAlertingService`] sends growth notices and builds reports

use std::sync::Arc;

use tracing::info;

use crate::config::StorageBackendConfig;

pub mod alerting;
pub mod backend;
pub mod error;
pub mod memory;
pub mod monitor;
pub mod retention;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use alerting::{NoticeKind, StorageAlertingService, StorageNotice, StorageUtilizationReport};
pub use backend::{HealthStatus, StorageBackend, UsageQuery};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use monitor::{
    DiskProbe, DiskSpace, GrowthAnalysis, ScriptedDiskProbe, StorageMonitor, SystemDiskProbe,
    project_growth,
};
pub use retention::{
    CleanupError, CleanupRecommendation, CleanupResult, DataRetentionManager, RetentionAction,
    RetentionPolicy, RetentionRule,
};
pub use schema::{CleanupRecord, CleanupTrigger, StorageUsage};

/// Open the configured history backend
pub async fn create_backend(config: &StorageBackendConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageBackendConfig::None => {
            info!("storage history kept in memory");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageBackendConfig::Sqlite { path, .. } => {
            let backend = sqlite::SqliteBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageBackendConfig::Sqlite { .. } => Err(StorageError::InvalidConfig(
            "sqlite backend requires the storage-sqlite feature".to_string(),
        )),
    }
}
