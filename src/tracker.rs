use crate::config::StoreConfig;
use crate::db::{repair, SqliteBackend};
use crate::errors::{AppError, AppResult};
use crate::events::{EventBus, StoreEvent};
use crate::importer::{DataImporter, ImportMode};
use crate::legacy::has_session_table;
use crate::migrator::SchemaMigrator;
use crate::models::{ImportSummary, MigrationReport, ProgressSink, ProviderInfo, RepairReport, SchemaShape};
use crate::providers::{ProviderRegistry, StorageBackend, Store};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Host-facing entry point: owns the provider registry and exposes the
/// file operations on the active database.
pub struct TrackerCore {
    config: StoreConfig,
    registry: ProviderRegistry,
    events: EventBus,
}

impl TrackerCore {
    /// Validates `config`, registers its providers, migrates a legacy
    /// database file in place if one is found and activates the configured
    /// provider.
    pub async fn open(config: StoreConfig) -> AppResult<Arc<Self>> {
        config.validate()?;
        if let (Some(log_dir), Some(logging)) = (config.log_dir(), config.logging.as_ref()) {
            if let Err(error) = crate::init_tracing(&log_dir, &logging.filter) {
                tracing::warn!(error = %error, "failed to initialize file logging");
            }
        }

        let events = EventBus::new();
        let this = Arc::new(Self {
            registry: ProviderRegistry::new(events.clone()),
            events,
            config,
        });

        for provider in &this.config.providers {
            let path = this.config.provider_path(provider);
            this.registry
                .register(&provider.name, Arc::new(SqliteBackend::new(provider.name.trim(), path)))?;
        }
        this.switch_provider(this.config.active_provider.trim()).await?;
        Ok(this)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Data-plane access routed to whichever provider is active.
    pub fn store(&self) -> &dyn Store {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn register_provider(&self, name: &str, path: impl Into<PathBuf>) -> AppResult<()> {
        self.registry
            .register(name, Arc::new(SqliteBackend::new(name.trim(), path)))
    }

    pub fn register_backend(&self, name: &str, backend: Arc<dyn StorageBackend>) -> AppResult<()> {
        self.registry.register(name, backend)
    }

    pub fn unregister_provider(&self, name: &str) -> AppResult<()> {
        self.registry.unregister(name)
    }

    /// Switches the active provider, first migrating its file if it still
    /// uses the legacy layout.
    pub async fn switch_provider(&self, name: &str) -> AppResult<()> {
        if let Some(backend) = self.registry.backend(name)? {
            if !backend.is_connected() {
                if let Some(path) = backend.database_path() {
                    migrate_legacy_file(&path, &self.config.backup_dir()).await?;
                }
            }
        }
        self.registry.switch_to(name)
    }

    pub fn available_providers(&self) -> AppResult<Vec<ProviderInfo>> {
        self.registry.available_providers()
    }

    pub fn active_provider(&self) -> Option<String> {
        self.registry.active_name()
    }

    pub fn active_database_path(&self) -> AppResult<PathBuf> {
        self.registry
            .active_backend()?
            .database_path()
            .ok_or_else(|| AppError::NotFound("active provider has no database file".to_string()))
    }

    pub async fn merge_data(&self, source: &Path, progress: Option<ProgressSink<'_>>) -> AppResult<ImportSummary> {
        self.import(source, ImportMode::Merge, progress).await
    }

    pub async fn replace_data(&self, source: &Path, progress: Option<ProgressSink<'_>>) -> AppResult<ImportSummary> {
        self.import(source, ImportMode::Replace, progress).await
    }

    async fn import(
        &self,
        source: &Path,
        mode: ImportMode,
        progress: Option<ProgressSink<'_>>,
    ) -> AppResult<ImportSummary> {
        let active_path = self.registry.active_backend()?.database_path();
        let summary = DataImporter::import(&self.registry, active_path.as_deref(), source, mode, progress).await?;
        let event = match mode {
            ImportMode::Merge => StoreEvent::DataMerged(summary),
            ImportMode::Replace => StoreEvent::DataReplaced(summary),
        };
        self.events.emit(&event);
        Ok(summary)
    }

    /// Copies the active database file to `destination`.
    pub fn export_database(&self, destination: &Path) -> AppResult<PathBuf> {
        let backend = self.registry.active_backend()?;
        if backend.in_transaction() {
            return Err(AppError::Transaction(
                "cannot export while a transaction is open".to_string(),
            ));
        }
        let source = backend
            .database_path()
            .ok_or_else(|| AppError::NotFound("active provider has no database file".to_string()))?;
        if source == destination {
            return Err(AppError::Io(format!(
                "export destination {} is the active database",
                destination.display()
            )));
        }
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = fs::copy(&source, destination)?;
        tracing::info!(source = %source.display(), destination = %destination.display(), bytes, "database exported");
        self.events.emit(&StoreEvent::DatabaseExported {
            path: destination.display().to_string(),
        });
        Ok(destination.to_path_buf())
    }

    /// Deletes every user row in one transaction, keeping the reserved
    /// client and project.
    pub fn reset_database(&self) -> AppResult<()> {
        self.in_transaction(repair::clear_user_data)?;
        tracing::info!(provider = ?self.active_provider(), "database reset");
        self.events.emit(&StoreEvent::DatabaseReset);
        Ok(())
    }

    /// Re-runs the integrity passes on the active database.
    pub fn repair_integrity(&self) -> AppResult<RepairReport> {
        self.in_transaction(repair::repair_integrity)
    }

    fn in_transaction<T>(&self, f: impl FnOnce(&dyn Store) -> AppResult<T>) -> AppResult<T> {
        let store = self.store();
        store.begin_transaction()?;
        match f(store) {
            Ok(value) => {
                store.commit()?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = store.rollback() {
                    tracing::warn!(error = %rollback_error, "rollback failed");
                }
                Err(error)
            }
        }
    }

    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

impl std::fmt::Debug for TrackerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerCore")
            .field("data_dir", &self.config.data_dir)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Migrates a legacy database file in place.
///
/// The original is backed up first and left untouched until the migrated
/// copy, built beside it as `<file>.migrating`, is complete. Returns `None`
/// when the file is missing, empty or already relational.
pub async fn migrate_legacy_file(path: &Path, backup_dir: &Path) -> AppResult<Option<MigrationReport>> {
    let is_populated = fs::metadata(path).map(|meta| meta.is_file() && meta.len() > 0).unwrap_or(false);
    if !is_populated {
        return Ok(None);
    }

    let source = SqliteBackend::open_read_only(path)?;
    let is_legacy = SchemaMigrator::detect_schema(&source) == SchemaShape::Legacy
        && has_session_table(&source).unwrap_or(false);
    if !is_legacy {
        source.close();
        return Ok(None);
    }

    tracing::info!(path = %path.display(), "legacy database detected");
    if let Err(error) = SchemaMigrator::backup_file(path, backup_dir) {
        source.close();
        return Err(error);
    }

    let staging = staging_path(path);
    remove_sqlite_files(&staging);
    let outcome = match SqliteBackend::open("migration", &staging) {
        Ok(destination) => {
            let report = SchemaMigrator::migrate(&source, &destination, None).await;
            destination.close();
            report
        }
        Err(error) => Err(AppError::Migration(error.to_string())),
    };
    source.close();

    match outcome {
        Ok(report) => {
            fs::rename(&staging, path).map_err(|error| {
                AppError::Migration(format!("cannot move migrated database into place: {}", error))
            })?;
            Ok(Some(report))
        }
        Err(error) => {
            remove_sqlite_files(&staging);
            Err(error)
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(".migrating");
    PathBuf::from(raw)
}

fn remove_sqlite_files(path: &Path) {
    for suffix in ["", "-journal", "-wal", "-shm"] {
        let mut raw = OsString::from(path.as_os_str());
        raw.push(suffix);
        let candidate = PathBuf::from(raw);
        if candidate.exists() {
            if let Err(error) = fs::remove_file(&candidate) {
                tracing::warn!(path = %candidate.display(), error = %error, "failed to remove partial database file");
            }
        }
    }
}
