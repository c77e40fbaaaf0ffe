pub mod catalog;
pub mod repair;

use crate::errors::{AppError, AppResult};
use crate::models::{
    RepairReport, Row, SqlValue, CURRENT_SCHEMA_VERSION, DEFAULT_CLIENT_ID, DEFAULT_CLIENT_NAME, DEFAULT_PROJECT_ID,
    DEFAULT_PROJECT_NAME,
};
use crate::providers::{StorageBackend, Store};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");
pub const SQLITE_KIND: &str = "sqlite";

static INSERT_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:--[^\n]*\n\s*)*(?:insert|replace)\b").expect("valid insert statement regex")
});

const TASK_INSTANCE_COLUMNS: &[&str] = &[
    "id",
    "task_id",
    "project_id",
    "client_id",
    "total_time",
    "last_used_at",
    "is_favorite",
    "created_at",
];

/// SQLite storage engine holding exactly one connection.
#[derive(Debug)]
pub struct SqliteBackend {
    name: String,
    path: PathBuf,
    read_only: bool,
    conn: Mutex<Option<Connection>>,
}

impl SqliteBackend {
    /// Creates a disconnected backend; `initialize` opens and bootstraps it.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            read_only: false,
            conn: Mutex::new(None),
        }
    }

    pub fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> AppResult<Self> {
        let backend = Self::new(name, path);
        backend.initialize()?;
        Ok(backend)
    }

    /// Opens an existing database file without bootstrapping or writing to it.
    pub fn open_read_only(path: &Path) -> AppResult<Self> {
        let backend = Self {
            name: format!("source:{}", path.display()),
            path: path.to_path_buf(),
            read_only: true,
            conn: Mutex::new(None),
        };
        backend.initialize()?;
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Re-runs the integrity passes inside one transaction, regardless of
    /// the recorded schema version.
    pub fn repair_integrity(&self) -> AppResult<RepairReport> {
        self.begin_transaction()?;
        match repair::repair_integrity(self) {
            Ok(report) => {
                self.commit()?;
                Ok(report)
            }
            Err(error) => {
                if let Err(rollback_error) = self.rollback() {
                    tracing::warn!(error = %rollback_error, "rollback after failed repair also failed");
                }
                Err(error)
            }
        }
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(|| {
            AppError::Connection(format!("provider '{}' is not connected", self.name))
        })?;
        f(conn)
    }

    fn open_connection(&self) -> AppResult<Connection> {
        if self.read_only {
            if !self.path.is_file() {
                return Err(AppError::Connection(format!(
                    "database file {} does not exist",
                    self.path.display()
                )));
            }
            let conn = Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
            )
            .map_err(|error| connection_error(&self.path, error))?;
            conn.query_row("SELECT COUNT(1) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
                .map_err(|error| connection_error(&self.path, error))?;
            return Ok(conn);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|error| {
                    AppError::Connection(format!("cannot create {}: {}", parent.display(), error))
                })?;
            }
        }
        let conn = Connection::open(&self.path).map_err(|error| connection_error(&self.path, error))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|error| connection_error(&self.path, error))?;
        if has_legacy_layout(&conn).map_err(|error| connection_error(&self.path, error))? {
            return Err(AppError::Migration(format!(
                "{} uses the legacy single-table layout and must be migrated before use",
                self.path.display()
            )));
        }
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|error| connection_error(&self.path, error))?;
        Ok(conn)
    }

    fn bootstrap(&self) -> AppResult<()> {
        let version = self.schema_version()?;
        if version > CURRENT_SCHEMA_VERSION {
            tracing::warn!(
                provider = %self.name,
                version,
                supported = CURRENT_SCHEMA_VERSION,
                "database schema is newer than this build; skipping bootstrap repairs"
            );
            return Ok(());
        }
        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        self.begin_transaction()?;
        let outcome = repair::repair_integrity(self).and_then(|report| {
            self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
            Ok(report)
        });
        match outcome {
            Ok(report) => {
                self.commit()?;
                tracing::info!(
                    provider = %self.name,
                    from_version = version,
                    to_version = CURRENT_SCHEMA_VERSION,
                    repaired = report.total_changes(),
                    "database schema bootstrapped"
                );
                Ok(())
            }
            Err(error) => {
                if let Err(rollback_error) = self.rollback() {
                    tracing::warn!(error = %rollback_error, "rollback after failed bootstrap also failed");
                }
                Err(error)
            }
        }
    }
}

impl Store for SqliteBackend {
    fn query(&self, sql: &str, params: &[SqlValue]) -> AppResult<Vec<Row>> {
        self.with_conn(|conn| {
            let mut statement = conn.prepare(sql).map_err(|error| AppError::query(sql, error))?;
            let columns: Vec<String> = statement
                .column_names()
                .into_iter()
                .map(ToString::to_string)
                .collect();
            let mut rows = statement
                .query(rusqlite::params_from_iter(params.iter()))
                .map_err(|error| AppError::query(sql, error))?;

            let mut result = Vec::new();
            while let Some(row) = rows.next().map_err(|error| AppError::query(sql, error))? {
                let values = columns
                    .iter()
                    .enumerate()
                    .map(|(index, name)| {
                        let value = row.get_ref(index).map(SqlValue::from).unwrap_or(SqlValue::Null);
                        (name.clone(), value)
                    })
                    .collect();
                result.push(Row::new(values));
            }
            Ok(result)
        })
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> AppResult<i64> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(sql, rusqlite::params_from_iter(params.iter()))
                .map_err(|error| AppError::execute(sql, error))?;
            if INSERT_STATEMENT.is_match(sql) {
                Ok(conn.last_insert_rowid())
            } else {
                Ok(i64::try_from(changed).unwrap_or(i64::MAX))
            }
        })
    }

    fn begin_transaction(&self) -> AppResult<()> {
        let statement = if self.read_only { "BEGIN DEFERRED" } else { "BEGIN IMMEDIATE" };
        self.with_conn(|conn| {
            if !conn.is_autocommit() {
                return Err(AppError::Transaction(
                    "a transaction is already open; nested transactions are not supported".to_string(),
                ));
            }
            conn.execute_batch(statement)
                .map_err(|error| AppError::Transaction(error.to_string()))
        })
    }

    fn commit(&self) -> AppResult<()> {
        self.with_conn(|conn| {
            if conn.is_autocommit() {
                return Err(AppError::Transaction("commit called without an open transaction".to_string()));
            }
            conn.execute_batch("COMMIT")
                .map_err(|error| AppError::Transaction(error.to_string()))
        })
    }

    fn rollback(&self) -> AppResult<()> {
        self.with_conn(|conn| {
            if conn.is_autocommit() {
                return Err(AppError::Transaction("rollback called without an open transaction".to_string()));
            }
            conn.execute_batch("ROLLBACK")
                .map_err(|error| AppError::Transaction(error.to_string()))
        })
    }

    fn metadata(&self, key: &str) -> AppResult<Option<String>> {
        self.with_conn(|conn| {
            if !table_exists(conn, "_metadata")? {
                return Ok(None);
            }
            let sql = "SELECT value FROM _metadata WHERE key = ?1";
            conn.query_row(sql, [key], |row| Ok(SqlValue::from(row.get_ref(0)?)))
                .optional()
                .map(|value| value.and_then(|value| value.to_text()))
                .map_err(|error| AppError::query(sql, error))
        })
    }

    fn set_metadata(&self, key: &str, value: &str) -> AppResult<()> {
        let sql = "INSERT INTO _metadata (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
                   ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";
        self.with_conn(|conn| {
            conn.execute(sql, params![key, value])
                .map_err(|error| AppError::execute(sql, error))?;
            Ok(())
        })
    }
}

impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        SQLITE_KIND
    }

    fn initialize(&self) -> AppResult<()> {
        let mut guard = self.lock()?;
        if guard.is_some() {
            return Ok(());
        }
        let conn = self.open_connection()?;
        if !self.read_only {
            ensure_schema_extensions(&conn)?;
            seed_reserved_rows(&conn)?;
        }
        *guard = Some(conn);
        drop(guard);

        if !self.read_only {
            if let Err(error) = self.bootstrap() {
                self.close();
                return Err(error);
            }
        }
        tracing::info!(
            provider = %self.name,
            path = %self.path.display(),
            read_only = self.read_only,
            "database connection opened"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    fn in_transaction(&self) -> bool {
        self.lock()
            .map(|guard| guard.as_ref().is_some_and(|conn| !conn.is_autocommit()))
            .unwrap_or(false)
    }

    fn close(&self) {
        let mut guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(conn) = guard.take() else {
            return;
        };
        if !conn.is_autocommit() {
            if let Err(error) = conn.execute_batch("ROLLBACK") {
                tracing::warn!(provider = %self.name, error = %error, "failed to roll back open transaction on close");
            }
        }
        if let Err((_, error)) = conn.close() {
            tracing::warn!(provider = %self.name, error = %error, "database close reported an error");
        }
        tracing::info!(provider = %self.name, "database connection closed");
    }

    fn database_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

fn connection_error(path: &Path, error: impl std::fmt::Display) -> AppError {
    AppError::Connection(format!("cannot open {}: {}", path.display(), error))
}

fn table_exists(conn: &Connection, table: &str) -> AppResult<bool> {
    let sql = "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1";
    let count: i64 = conn
        .query_row(sql, [table], |row| row.get(0))
        .map_err(|error| AppError::query(sql, error))?;
    Ok(count > 0)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let sql = "SELECT COUNT(1) FROM pragma_table_info(?1) WHERE name = ?2";
    let count: i64 = conn
        .query_row(sql, [table, column], |row| row.get(0))
        .map_err(|error| AppError::query(sql, error))?;
    Ok(count > 0)
}

/// A pre-relational file keeps session timing on `tasks` rows and never
/// recorded a relational schema version.
fn has_legacy_layout(conn: &Connection) -> AppResult<bool> {
    if !table_exists(conn, "tasks")? || table_exists(conn, "task_instances")? {
        return Ok(false);
    }
    Ok(column_exists(conn, "tasks", "project_id")? || column_exists(conn, "tasks", "start_time")?)
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, definition: &str) -> AppResult<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition);
    match conn.execute(&sql, []) {
        Ok(_) => {
            tracing::debug!(table, column, "added missing column");
            Ok(())
        }
        Err(error) if error.to_string().contains("duplicate column") => Ok(()),
        Err(error) => Err(AppError::execute(&sql, error)),
    }
}

fn ensure_schema_extensions(conn: &Connection) -> AppResult<()> {
    add_column_if_missing(conn, "clients", "rate", "REAL NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "clients", "currency", "TEXT NOT NULL DEFAULT 'USD'")?;
    add_column_if_missing(conn, "projects", "icon", "TEXT NOT NULL DEFAULT 'folder-symbolic'")?;
    add_column_if_missing(conn, "projects", "icon_color_mode", "TEXT NOT NULL DEFAULT 'auto'")?;
    add_column_if_missing(conn, "projects", "icon_color", "TEXT NOT NULL DEFAULT '#ffffff'")?;
    add_column_if_missing(conn, "projects", "client_id", "INTEGER REFERENCES clients(id) ON DELETE SET NULL")?;
    add_column_if_missing(conn, "projects", "total_time", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "task_instances", "total_time", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "task_instances", "last_used_at", "TEXT")?;
    add_column_if_missing(conn, "task_instances", "is_favorite", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "time_entries", "duration", "INTEGER DEFAULT 0")?;

    drop_task_instance_uniqueness(conn)
}

/// Stacks need several instances of the same (task, project, client)
/// triple, so any uniqueness constraint from older builds is removed by
/// rebuilding the table.
fn drop_task_instance_uniqueness(conn: &Connection) -> AppResult<()> {
    let ddl_sql = "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'task_instances'";
    let ddl: Option<String> = conn
        .query_row(ddl_sql, [], |row| row.get(0))
        .optional()
        .map_err(|error| AppError::query(ddl_sql, error))?;
    let Some(ddl) = ddl else {
        return Ok(());
    };
    if !ddl.to_ascii_uppercase().contains("UNIQUE") {
        return Ok(());
    }

    let mut copied = Vec::new();
    for column in TASK_INSTANCE_COLUMNS {
        if column_exists(conn, "task_instances", column)? {
            copied.push(*column);
        }
    }
    let column_list = copied.join(", ");

    conn.execute_batch("PRAGMA foreign_keys = OFF;")
        .map_err(|error| AppError::execute("PRAGMA foreign_keys = OFF", error))?;
    let rebuild = conn.execute_batch(&format!(
        "BEGIN;
         CREATE TABLE task_instances_rebuild (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           task_id INTEGER NOT NULL,
           project_id INTEGER,
           client_id INTEGER,
           total_time INTEGER NOT NULL DEFAULT 0,
           last_used_at TEXT,
           is_favorite INTEGER NOT NULL DEFAULT 0,
           created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
           FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE,
           FOREIGN KEY(project_id) REFERENCES projects(id) ON DELETE CASCADE,
           FOREIGN KEY(client_id) REFERENCES clients(id) ON DELETE CASCADE
         );
         INSERT INTO task_instances_rebuild ({columns}) SELECT {columns} FROM task_instances;
         DROP TABLE task_instances;
         ALTER TABLE task_instances_rebuild RENAME TO task_instances;
         CREATE INDEX IF NOT EXISTS idx_task_instances_task ON task_instances(task_id);
         CREATE INDEX IF NOT EXISTS idx_task_instances_project ON task_instances(project_id);
         COMMIT;",
        columns = column_list
    ));
    if rebuild.is_err() && !conn.is_autocommit() {
        if let Err(error) = conn.execute_batch("ROLLBACK;") {
            tracing::warn!(error = %error, "rollback after failed task_instances rebuild also failed");
        }
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|error| AppError::execute("PRAGMA foreign_keys = ON", error))?;
    rebuild.map_err(|error| AppError::Execute {
        sql: "rebuild task_instances without UNIQUE".to_string(),
        message: error.to_string(),
    })?;
    tracing::info!("removed uniqueness constraint from task_instances");
    Ok(())
}

fn seed_reserved_rows(conn: &Connection) -> AppResult<()> {
    seed_reserved_row(conn, "clients", DEFAULT_CLIENT_ID, DEFAULT_CLIENT_NAME)?;
    seed_reserved_row(conn, "projects", DEFAULT_PROJECT_ID, DEFAULT_PROJECT_NAME)
}

fn seed_reserved_row(conn: &Connection, table: &str, id: i64, name: &str) -> AppResult<()> {
    let insert = format!("INSERT OR IGNORE INTO {} (id, name) VALUES (?1, ?2)", table);
    conn.execute(&insert, params![id, name])
        .map_err(|error| AppError::execute(&insert, error))?;
    let exists = format!("SELECT COUNT(1) FROM {} WHERE id = ?1", table);
    let count: i64 = conn
        .query_row(&exists, [id], |row| row.get(0))
        .map_err(|error| AppError::query(&exists, error))?;
    if count == 0 {
        // The default name is held by a user row; keep the id reserved anyway.
        let reserved = format!("INSERT INTO {} (id, name) VALUES (?1, ?2)", table);
        conn.execute(&reserved, params![id, format!("{} (reserved)", name)])
            .map_err(|error| AppError::execute(&reserved, error))?;
    }
    Ok(())
}
