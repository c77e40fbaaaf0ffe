pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod importer;
pub mod legacy;
pub mod migrator;
pub mod models;
pub mod providers;
pub mod tracker;
mod transfer;

pub use crate::config::{default_data_dir, LoggingConfig, ProviderConfig, ProviderKind, StoreConfig};
pub use crate::db::SqliteBackend;
pub use crate::errors::{AppError, AppResult};
pub use crate::events::{EventBus, EventKind, StoreEvent, SubscriptionId};
pub use crate::importer::{DataImporter, ImportMode};
pub use crate::migrator::SchemaMigrator;
pub use crate::models::{
    derive_icon_color, IconColorMode, ImportSummary, MigrationReport, ProgressSink, ProviderInfo, RepairReport, Row,
    SchemaShape, SqlValue, StepProgress,
};
pub use crate::providers::{Capabilities, ProviderRegistry, StorageBackend, Store};
pub use crate::tracker::{migrate_legacy_file, TrackerCore};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs JSON logging to a daily rolling file under `log_dir`.
/// `RUST_LOG` overrides `filter`. Later calls are no-ops.
pub fn init_tracing(log_dir: &Path, filter: &str) -> AppResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "timekeep-store.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::init_tracing;

    #[test]
    fn tracing_initialization_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join("logs");
        assert!(init_tracing(&logs, "debug").is_ok());
        assert!(init_tracing(&logs, "info").is_ok());
    }
}
