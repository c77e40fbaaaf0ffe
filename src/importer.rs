use crate::db::{repair, SqliteBackend};
use crate::errors::{AppError, AppResult};
use crate::legacy::read_sessions;
use crate::migrator::SchemaMigrator;
use crate::models::{report_progress, ImportSummary, ProgressSink, SchemaShape};
use crate::providers::{StorageBackend, Store};
use crate::transfer::{SessionTiming, Transfer};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Wipe user data first, keeping the reserved client and project.
    Replace,
    /// Layer the source on top of existing data.
    Merge,
}

impl ImportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
        }
    }
}

/// Brings rows from an external database file into a live store.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataImporter;

impl DataImporter {
    pub async fn replace_data(
        destination: &dyn Store,
        active_path: Option<&Path>,
        source_path: &Path,
        progress: Option<ProgressSink<'_>>,
    ) -> AppResult<ImportSummary> {
        Self::import(destination, active_path, source_path, ImportMode::Replace, progress).await
    }

    pub async fn merge_data(
        destination: &dyn Store,
        active_path: Option<&Path>,
        source_path: &Path,
        progress: Option<ProgressSink<'_>>,
    ) -> AppResult<ImportSummary> {
        Self::import(destination, active_path, source_path, ImportMode::Merge, progress).await
    }

    /// Runs the whole import in one destination transaction. The source is
    /// opened read-only and closed whatever the outcome.
    pub async fn import(
        destination: &dyn Store,
        active_path: Option<&Path>,
        source_path: &Path,
        mode: ImportMode,
        progress: Option<ProgressSink<'_>>,
    ) -> AppResult<ImportSummary> {
        if let Some(active_path) = active_path {
            if same_file(active_path, source_path) {
                return Err(AppError::Import(format!(
                    "{} is the active database and cannot be imported into itself",
                    source_path.display()
                )));
            }
        }
        let source = SqliteBackend::open_read_only(source_path).map_err(into_import_error)?;
        let shape = SchemaMigrator::detect_schema(&source);
        tracing::info!(
            mode = mode.as_str(),
            source = %source_path.display(),
            shape = shape.as_str(),
            "starting data import"
        );

        let outcome = Self::import_in_transaction(&source, destination, shape, mode, progress).await;
        source.close();
        match outcome {
            Ok(summary) => {
                tracing::info!(
                    mode = mode.as_str(),
                    clients_added = summary.clients_added,
                    projects_added = summary.projects_added,
                    tasks_added = summary.tasks_added,
                    instances_added = summary.instances_added,
                    entries_added = summary.entries_added,
                    "data import complete"
                );
                Ok(summary)
            }
            Err(error) => {
                tracing::error!(mode = mode.as_str(), error = %error, "data import failed");
                Err(into_import_error(error))
            }
        }
    }

    async fn import_in_transaction(
        source: &dyn Store,
        destination: &dyn Store,
        shape: SchemaShape,
        mode: ImportMode,
        progress: Option<ProgressSink<'_>>,
    ) -> AppResult<ImportSummary> {
        destination.begin_transaction()?;
        match Self::run_pipeline(source, destination, shape, mode, progress).await {
            Ok(summary) => {
                destination.commit()?;
                Ok(summary)
            }
            Err(error) => {
                if let Err(rollback_error) = destination.rollback() {
                    tracing::warn!(error = %rollback_error, "rollback after failed import also failed");
                }
                Err(error)
            }
        }
    }

    async fn run_pipeline(
        source: &dyn Store,
        destination: &dyn Store,
        shape: SchemaShape,
        mode: ImportMode,
        progress: Option<ProgressSink<'_>>,
    ) -> AppResult<ImportSummary> {
        let mut steps: Vec<&str> = Vec::new();
        if mode == ImportMode::Replace {
            steps.push("Clearing existing data");
        }
        steps.extend(["Importing clients", "Importing projects"]);
        match shape {
            SchemaShape::Current => steps.extend(["Importing tasks", "Importing task instances", "Importing time entries"]),
            SchemaShape::Legacy => steps.extend(["Importing tasks", "Importing sessions"]),
        }
        steps.push("Recomputing totals");
        let total = steps.len();
        let mut current = 0;
        let mut advance = || {
            current += 1;
            let description = steps[current - 1];
            report_progress(progress, current, total, description);
        };

        if mode == ImportMode::Replace {
            advance();
            repair::clear_user_data(destination)?;
            tokio::task::yield_now().await;
        }

        let mut transfer = Transfer::new(source, destination);
        advance();
        transfer.transfer_clients()?;
        tokio::task::yield_now().await;

        advance();
        transfer.transfer_projects()?;
        tokio::task::yield_now().await;

        match shape {
            SchemaShape::Current => {
                advance();
                transfer.transfer_tasks()?;
                tokio::task::yield_now().await;

                advance();
                transfer.transfer_instances()?;
                tokio::task::yield_now().await;

                advance();
                transfer.transfer_entries()?;
                tokio::task::yield_now().await;
            }
            SchemaShape::Legacy => {
                let sessions = read_sessions(source)?;
                advance();
                transfer.transfer_legacy_tasks(&sessions)?;
                tokio::task::yield_now().await;

                advance();
                transfer.transfer_legacy_sessions(&sessions, SessionTiming::PositiveOnly)?;
                tokio::task::yield_now().await;
            }
        }

        advance();
        repair::recompute_totals(destination)?;
        Ok(transfer.summary())
    }
}

/// Whether both paths name the same file on disk. Falls back to comparing
/// the paths when either cannot be canonicalized.
fn same_file(left: &Path, right: &Path) -> bool {
    match (fs::canonicalize(left), fs::canonicalize(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

fn into_import_error(error: AppError) -> AppError {
    match error {
        AppError::Import(_) => error,
        other => AppError::Import(other.to_string()),
    }
}
