use crate::db::repair;
use crate::errors::{AppError, AppResult};
use crate::legacy::read_sessions;
use crate::models::{
    report_progress, MigrationReport, ProgressSink, SchemaShape, CURRENT_SCHEMA_VERSION, MIN_RELATIONAL_SCHEMA_VERSION,
    SCHEMA_VERSION_KEY,
};
use crate::providers::Store;
use crate::transfer::{SessionTiming, Transfer};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};

const STEPS: [&str; 6] = [
    "Migrating clients",
    "Migrating projects",
    "Migrating tasks",
    "Building task instances",
    "Building time entries",
    "Recomputing totals",
];

/// Detects the pre-relational layout and rewrites it into the current
/// relational model.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaMigrator;

impl SchemaMigrator {
    pub const TOTAL_STEPS: usize = STEPS.len();

    /// `Legacy` unless the source records a relational schema version.
    /// Any failure while probing is treated as legacy.
    pub fn detect_schema(source: &dyn Store) -> SchemaShape {
        match source.metadata(SCHEMA_VERSION_KEY) {
            Ok(Some(raw)) => match raw.trim().parse::<i64>() {
                Ok(version) if version >= MIN_RELATIONAL_SCHEMA_VERSION => SchemaShape::Current,
                _ => SchemaShape::Legacy,
            },
            Ok(None) => SchemaShape::Legacy,
            Err(error) => {
                tracing::warn!(error = %error, "schema detection failed; assuming legacy layout");
                SchemaShape::Legacy
            }
        }
    }

    /// Copies `source` into `destination` in six ordered steps inside one
    /// destination transaction. Nothing is kept if any step fails.
    pub async fn migrate(
        source: &dyn Store,
        destination: &dyn Store,
        progress: Option<ProgressSink<'_>>,
    ) -> AppResult<MigrationReport> {
        let shape = Self::detect_schema(source);
        tracing::info!(shape = shape.as_str(), "starting schema migration");

        destination.begin_transaction().map_err(into_migration_error)?;
        match Self::run_steps(source, destination, shape, progress).await {
            Ok(report) => {
                destination.commit().map_err(into_migration_error)?;
                tracing::info!(
                    shape = shape.as_str(),
                    clients = report.clients,
                    projects = report.projects,
                    tasks = report.tasks,
                    task_instances = report.task_instances,
                    time_entries = report.time_entries,
                    "schema migration complete"
                );
                Ok(report)
            }
            Err(error) => {
                if let Err(rollback_error) = destination.rollback() {
                    tracing::warn!(error = %rollback_error, "rollback after failed migration also failed");
                }
                tracing::error!(error = %error, "schema migration failed");
                Err(into_migration_error(error))
            }
        }
    }

    async fn run_steps(
        source: &dyn Store,
        destination: &dyn Store,
        shape: SchemaShape,
        progress: Option<ProgressSink<'_>>,
    ) -> AppResult<MigrationReport> {
        let mut transfer = Transfer::new(source, destination).with_reserved_rows();
        let sessions = match shape {
            SchemaShape::Legacy => read_sessions(source)?,
            SchemaShape::Current => Vec::new(),
        };

        step(progress, 0).await;
        transfer.transfer_clients()?;

        step(progress, 1).await;
        transfer.transfer_projects()?;

        step(progress, 2).await;
        match shape {
            SchemaShape::Legacy => transfer.transfer_legacy_tasks(&sessions)?,
            SchemaShape::Current => transfer.transfer_tasks()?,
        };

        step(progress, 3).await;
        match shape {
            SchemaShape::Legacy => transfer.transfer_legacy_instances(&sessions)?,
            SchemaShape::Current => transfer.transfer_instances()?,
        };

        step(progress, 4).await;
        match shape {
            SchemaShape::Legacy => transfer.transfer_legacy_entries(&sessions, SessionTiming::KeepAll)?,
            SchemaShape::Current => transfer.transfer_entries()?,
        };

        step(progress, 5).await;
        repair::repair_integrity(destination)?;
        destination.set_schema_version(CURRENT_SCHEMA_VERSION)?;

        let summary = transfer.summary();
        Ok(MigrationReport {
            source_shape: Some(shape),
            clients: summary.clients_added,
            projects: summary.projects_added,
            tasks: summary.tasks_added,
            task_instances: summary.instances_added,
            time_entries: summary.entries_added,
        })
    }

    /// Copies `source` byte-for-byte into `backup_dir` under a timestamped
    /// name and verifies the copy's size. Returns the backup path.
    pub fn backup_file(source: &Path, backup_dir: &Path) -> AppResult<PathBuf> {
        let expected = fs::metadata(source)
            .map_err(|error| AppError::Migration(format!("cannot read {}: {}", source.display(), error)))?
            .len();
        fs::create_dir_all(backup_dir).map_err(|error| {
            AppError::Migration(format!("cannot create backup directory {}: {}", backup_dir.display(), error))
        })?;

        let stem = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("database");
        let extension = source.extension().and_then(|ext| ext.to_str()).unwrap_or("db");
        let stamp = Local::now().format("%Y%m%d-%H%M%S%3f").to_string();
        let mut target = backup_dir.join(format!("{}-backup-{}.{}", stem, stamp, extension));
        let mut attempt = 1;
        while target.exists() {
            target = backup_dir.join(format!("{}-backup-{}-{}.{}", stem, stamp, attempt, extension));
            attempt += 1;
        }

        let copied = fs::copy(source, &target)
            .map_err(|error| AppError::Migration(format!("backup of {} failed: {}", source.display(), error)))?;
        if copied != expected {
            let _ = fs::remove_file(&target);
            return Err(AppError::Migration(format!(
                "backup of {} is incomplete ({} of {} bytes)",
                source.display(),
                copied,
                expected
            )));
        }
        tracing::info!(source = %source.display(), backup = %target.display(), bytes = copied, "database backed up");
        Ok(target)
    }
}

async fn step(progress: Option<ProgressSink<'_>>, index: usize) {
    report_progress(progress, index + 1, SchemaMigrator::TOTAL_STEPS, STEPS[index]);
    tokio::task::yield_now().await;
}

fn into_migration_error(error: AppError) -> AppError {
    match error {
        AppError::Migration(_) => error,
        other => AppError::Migration(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::SchemaMigrator;
    use crate::db::catalog::count_rows;
    use crate::db::SqliteBackend;
    use crate::errors::AppError;
    use crate::legacy::fixtures::write_legacy_database;
    use crate::models::{SchemaShape, StepProgress};
    use crate::providers::{StorageBackend, Store};
    use crate::sql_params;
    use std::sync::Mutex;

    fn scalar(store: &dyn Store, sql: &str) -> i64 {
        store
            .query_one(sql, &[])
            .expect("query")
            .and_then(|row| row.i64("value"))
            .expect("value")
    }

    #[tokio::test]
    async fn migrates_legacy_sessions_into_stacked_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let legacy_path = dir.path().join("legacy.db");
        write_legacy_database(&legacy_path);
        let source = SqliteBackend::open_read_only(&legacy_path).expect("source");
        let destination = SqliteBackend::open("local", dir.path().join("current.db")).expect("destination");

        assert_eq!(SchemaMigrator::detect_schema(&source), SchemaShape::Legacy);
        let seen = Mutex::new(Vec::<StepProgress>::new());
        let sink = |progress: StepProgress| {
            if let Ok(mut seen) = seen.lock() {
                seen.push(progress);
            }
        };
        let report = SchemaMigrator::migrate(&source, &destination, Some(&sink))
            .await
            .expect("migrate");

        assert_eq!(report.source_shape, Some(SchemaShape::Legacy));
        assert_eq!(report.clients, 1);
        assert_eq!(report.projects, 1);
        assert_eq!(report.tasks, 2);
        assert_eq!(report.task_instances, 4);
        assert_eq!(report.time_entries, 3);

        let steps = seen.lock().expect("progress");
        assert_eq!(steps.len(), SchemaMigrator::TOTAL_STEPS);
        assert_eq!(steps[0].step, 1);
        assert_eq!(steps[5].total_steps, 6);

        // Both Design sessions stay separate instances of the same triple.
        let design_instances = scalar(
            &destination,
            "SELECT COUNT(1) AS value FROM task_instances ti JOIN tasks t ON t.id = ti.task_id WHERE t.name = 'Design'",
        );
        assert_eq!(design_instances, 2);

        let website = destination
            .query_one(
                "SELECT p.total_time, p.icon_color, c.name AS client FROM projects p JOIN clients c ON c.id = p.client_id
                 WHERE p.name = 'Website'",
                &[],
            )
            .expect("website")
            .expect("website row");
        assert_eq!(website.i64("total_time"), Some(5400));
        assert_eq!(website.text("icon_color"), Some("#000000"));
        assert_eq!(website.text("client"), Some("Acme"));

        let reconstructed = destination
            .query_one(
                "SELECT te.start_time, te.end_time, te.duration FROM time_entries te
                 JOIN task_instances ti ON ti.id = te.task_instance_id
                 JOIN tasks t ON t.id = ti.task_id
                 WHERE t.name = 'Review'",
                &[],
            )
            .expect("review entry")
            .expect("review row");
        assert_eq!(reconstructed.text("start_time"), Some("2024-03-03 11:50:00"));
        assert_eq!(reconstructed.text("end_time"), Some("2024-03-03 12:00:00"));
        assert_eq!(reconstructed.i64("duration"), Some(600));
        assert_eq!(scalar(&destination, "SELECT total_time AS value FROM projects WHERE id = 1"), 600);
        assert_eq!(destination.schema_version().expect("version"), 4);
    }

    #[tokio::test]
    async fn current_sources_are_copied_and_totals_recomputed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = SqliteBackend::open("source", dir.path().join("source.db")).expect("source");
        let task = source
            .execute("INSERT INTO tasks (name) VALUES (?1)", &sql_params!["Plan"])
            .expect("task");
        let instance = source
            .execute(
                "INSERT INTO task_instances (task_id, project_id, client_id, total_time) VALUES (?1, 1, 1, 99999)",
                &sql_params![task],
            )
            .expect("instance");
        source
            .execute(
                "INSERT INTO time_entries (task_instance_id, start_time, end_time, duration) VALUES (?1, ?2, ?3, 120)",
                &sql_params![instance, "2024-05-01 08:00:00", "2024-05-01 08:02:00"],
            )
            .expect("entry");
        source
            .execute("UPDATE clients SET rate = 95.5, currency = 'EUR' WHERE id = 1", &[])
            .expect("reserved client");
        source
            .execute("UPDATE projects SET color = '#ffffff', icon = 'star-symbolic' WHERE id = 1", &[])
            .expect("reserved project");
        assert_eq!(SchemaMigrator::detect_schema(&source), SchemaShape::Current);

        let destination = SqliteBackend::open("local", dir.path().join("current.db")).expect("destination");
        let report = SchemaMigrator::migrate(&source, &destination, None).await.expect("migrate");
        assert_eq!(report.source_shape, Some(SchemaShape::Current));
        assert_eq!(report.task_instances, 1);
        assert_eq!(scalar(&destination, "SELECT total_time AS value FROM task_instances"), 120);

        let client = destination
            .query_one("SELECT name, rate, currency FROM clients WHERE id = 1", &[])
            .expect("client")
            .expect("client row");
        assert_eq!(client.text("name"), Some("Default Client"));
        assert_eq!(client.f64("rate"), Some(95.5));
        assert_eq!(client.text("currency"), Some("EUR"));
        let project = destination
            .query_one("SELECT color, icon FROM projects WHERE id = 1", &[])
            .expect("project")
            .expect("project row");
        assert_eq!(project.text("color"), Some("#ffffff"));
        assert_eq!(project.text("icon"), Some("star-symbolic"));
    }

    #[tokio::test]
    async fn failed_step_leaves_destination_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let legacy_path = dir.path().join("legacy.db");
        write_legacy_database(&legacy_path);
        {
            let conn = rusqlite::Connection::open(&legacy_path).expect("conn");
            conn.execute("INSERT INTO projects (id, name) VALUES (3, NULL)", [])
                .expect("nameless project");
        }
        let source = SqliteBackend::open_read_only(&legacy_path).expect("source");
        let destination = SqliteBackend::open("local", dir.path().join("current.db")).expect("destination");

        let error = SchemaMigrator::migrate(&source, &destination, None)
            .await
            .expect_err("should fail");
        assert!(matches!(error, AppError::Migration(_)));
        assert_eq!(count_rows(&destination, "clients").expect("clients"), 1);
        assert_eq!(count_rows(&destination, "projects").expect("projects"), 1);
        assert_eq!(count_rows(&destination, "missing_table").expect("missing"), 0);
        assert!(!destination.in_transaction());
    }

    #[test]
    fn unreadable_or_unversioned_sources_detect_as_legacy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = dir.path().join("empty.db");
        rusqlite::Connection::open(&empty)
            .and_then(|conn| conn.execute_batch("CREATE TABLE notes (id INTEGER);"))
            .expect("empty db");
        let source = SqliteBackend::open_read_only(&empty).expect("source");
        assert_eq!(SchemaMigrator::detect_schema(&source), SchemaShape::Legacy);

        source.close();
        assert_eq!(SchemaMigrator::detect_schema(&source), SchemaShape::Legacy);
    }

    #[test]
    fn versions_are_read_whatever_their_storage_class() {
        let dir = tempfile::tempdir().expect("tempdir");
        for (file, version, expected) in [
            ("integer.db", "4", SchemaShape::Current),
            ("real.db", "2.0", SchemaShape::Current),
            ("text.db", "'3'", SchemaShape::Current),
            ("old.db", "'1'", SchemaShape::Legacy),
            ("low.db", "1", SchemaShape::Legacy),
        ] {
            let path = dir.path().join(file);
            rusqlite::Connection::open(&path)
                .and_then(|conn| {
                    conn.execute_batch(&format!(
                        "CREATE TABLE _metadata (key TEXT PRIMARY KEY, value);
                         INSERT INTO _metadata VALUES ('schema_version', {});",
                        version
                    ))
                })
                .expect("versioned db");
            let source = SqliteBackend::open_read_only(&path).expect("source");
            assert_eq!(SchemaMigrator::detect_schema(&source), expected, "{}", file);
            source.close();
        }
    }

    #[test]
    fn backup_copies_bytes_under_a_timestamped_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("time-tracker.db");
        std::fs::write(&source, b"sqlite bytes").expect("write");

        let first = SchemaMigrator::backup_file(&source, &dir.path().join("backups")).expect("backup");
        let second = SchemaMigrator::backup_file(&source, &dir.path().join("backups")).expect("backup");
        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).expect("read"), b"sqlite bytes");
        let name = first.file_name().and_then(|name| name.to_str()).expect("name");
        assert!(name.starts_with("time-tracker-backup-"));
        assert!(name.ends_with(".db"));

        let missing = SchemaMigrator::backup_file(&dir.path().join("missing.db"), dir.path());
        assert!(matches!(missing, Err(AppError::Migration(_))));
    }
}
