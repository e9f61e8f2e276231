//! Integration tests for a fully wired scaler instance

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/processing.rs"]
mod processing;

#[path = "integration/scaling.rs"]
mod scaling;

#[path = "integration/storage.rs"]
mod storage;

#[cfg(feature = "storage-sqlite")]
#[path = "integration/storage_persistence.rs"]
mod storage_persistence;
