//! Row transfer between two stores with source-to-destination id remapping.
//!
//! Clients, projects and tasks are matched by name and reuse the
//! destination row when one exists. Task instances are always inserted so
//! stacks of repeated sessions stay distinct. Time entries are skipped when
//! the destination instance already has an entry with the same start time.

use crate::db::catalog::table_exists;
use crate::errors::{AppError, AppResult};
use crate::legacy::{distinct_task_names, LegacySession};
use crate::models::{
    derive_icon_color, format_timestamp, parse_timestamp, IconColorMode, ImportSummary, Row, SqlValue,
    DEFAULT_CLIENT_ID, DEFAULT_PROJECT_COLOR, DEFAULT_PROJECT_ID,
};
use crate::providers::Store;
use crate::sql_params;
use std::collections::HashMap;

const DEFAULT_PROJECT_ICON: &str = "folder-symbolic";
const DEFAULT_CURRENCY: &str = "USD";

/// Source id to destination id. The reserved id 1 always maps to itself.
#[derive(Debug, Clone)]
pub(crate) struct IdMap {
    ids: HashMap<i64, i64>,
}

impl IdMap {
    pub(crate) fn reserved(reserved_id: i64) -> Self {
        let mut ids = HashMap::new();
        ids.insert(reserved_id, reserved_id);
        Self { ids }
    }

    pub(crate) fn empty() -> Self {
        Self { ids: HashMap::new() }
    }

    pub(crate) fn insert(&mut self, source: i64, destination: i64) {
        self.ids.insert(source, destination);
    }

    pub(crate) fn get(&self, source: i64) -> Option<i64> {
        self.ids.get(&source).copied()
    }

    /// Maps `source`, falling back to `default` for NULL or unknown ids.
    pub(crate) fn resolve_or(&self, source: Option<i64>, default: i64) -> i64 {
        source.and_then(|id| self.get(id)).unwrap_or(default)
    }
}

/// How legacy sessions that carry no usable timing are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionTiming {
    /// Any reconstructable interval becomes an entry, zero-length included.
    KeepAll,
    /// Only sessions with a positive duration get an entry.
    PositiveOnly,
}

pub(crate) struct Transfer<'a> {
    source: &'a dyn Store,
    destination: &'a dyn Store,
    clients: IdMap,
    projects: IdMap,
    tasks: IdMap,
    task_names: HashMap<String, i64>,
    instances: IdMap,
    project_clients: HashMap<i64, Option<i64>>,
    copy_reserved: bool,
    summary: ImportSummary,
}

impl<'a> Transfer<'a> {
    pub(crate) fn new(source: &'a dyn Store, destination: &'a dyn Store) -> Self {
        Self {
            source,
            destination,
            clients: IdMap::reserved(DEFAULT_CLIENT_ID),
            projects: IdMap::reserved(DEFAULT_PROJECT_ID),
            tasks: IdMap::empty(),
            task_names: HashMap::new(),
            instances: IdMap::empty(),
            project_clients: HashMap::new(),
            copy_reserved: false,
            summary: ImportSummary::default(),
        }
    }

    /// Also copies the attributes of the source's reserved client and
    /// project onto the destination's. Names stay as they are.
    pub(crate) fn with_reserved_rows(mut self) -> Self {
        self.copy_reserved = true;
        self
    }

    pub(crate) fn summary(&self) -> ImportSummary {
        self.summary
    }

    fn source_rows(&self, table: &str) -> AppResult<Vec<Row>> {
        if !table_exists(self.source, table)? {
            tracing::debug!(table, "source has no such table; nothing to transfer");
            return Ok(Vec::new());
        }
        self.source.query(&format!("SELECT * FROM {} ORDER BY id ASC", table), &[])
    }

    fn existing_id(&self, table: &str, name: &str) -> AppResult<Option<i64>> {
        let sql = format!("SELECT id FROM {} WHERE name = ?1 LIMIT 1", table);
        Ok(self
            .destination
            .query_one(&sql, &sql_params![name])?
            .and_then(|row| row.i64("id")))
    }

    pub(crate) fn transfer_clients(&mut self) -> AppResult<usize> {
        for row in self.source_rows("clients")? {
            let source_id = required_id(&row, "clients")?;
            if source_id == DEFAULT_CLIENT_ID {
                if self.copy_reserved {
                    self.destination.execute(
                        "UPDATE clients SET rate = COALESCE(?1, rate), currency = COALESCE(?2, currency) WHERE id = ?3",
                        &sql_params![row.f64("rate"), row.non_empty_text("currency"), DEFAULT_CLIENT_ID],
                    )?;
                }
                continue;
            }
            let name = required_name(&row, "clients", source_id)?;
            let destination_id = match self.existing_id("clients", &name)? {
                Some(id) => id,
                None => {
                    let id = self.destination.execute(
                        "INSERT INTO clients (name, rate, currency) VALUES (?1, ?2, ?3)",
                        &sql_params![
                            name.as_str(),
                            row.f64("rate").unwrap_or(0.0),
                            row.non_empty_text("currency").unwrap_or_else(|| DEFAULT_CURRENCY.to_string())
                        ],
                    )?;
                    self.summary.clients_added += 1;
                    id
                }
            };
            self.clients.insert(source_id, destination_id);
        }
        Ok(self.summary.clients_added)
    }

    pub(crate) fn transfer_projects(&mut self) -> AppResult<usize> {
        for row in self.source_rows("projects")? {
            let source_id = required_id(&row, "projects")?;
            if source_id == DEFAULT_PROJECT_ID {
                if self.copy_reserved {
                    self.copy_reserved_project(&row)?;
                }
                continue;
            }
            let name = required_name(&row, "projects", source_id)?;
            let client_id = row.i64("client_id").and_then(|id| self.clients.get(id));
            let destination_id = match self.existing_id("projects", &name)? {
                Some(id) => id,
                None => {
                    let color = row
                        .non_empty_text("color")
                        .unwrap_or_else(|| DEFAULT_PROJECT_COLOR.to_string());
                    let mode = row
                        .text("icon_color_mode")
                        .map(IconColorMode::parse)
                        .unwrap_or_default();
                    let icon_color = row
                        .non_empty_text("icon_color")
                        .unwrap_or_else(|| derive_icon_color(&color, mode));
                    let id = self.destination.execute(
                        "INSERT INTO projects (name, color, icon, icon_color_mode, icon_color, client_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        &sql_params![
                            name.as_str(),
                            color,
                            row.non_empty_text("icon").unwrap_or_else(|| DEFAULT_PROJECT_ICON.to_string()),
                            mode.as_str(),
                            icon_color,
                            client_id
                        ],
                    )?;
                    self.summary.projects_added += 1;
                    id
                }
            };
            self.projects.insert(source_id, destination_id);
        }
        Ok(self.summary.projects_added)
    }

    fn copy_reserved_project(&self, row: &Row) -> AppResult<()> {
        let color = row.non_empty_text("color");
        let mode = row.text("icon_color_mode").map(IconColorMode::parse);
        let icon_color = row.non_empty_text("icon_color").or_else(|| {
            color
                .as_deref()
                .map(|color| derive_icon_color(color, mode.unwrap_or_default()))
        });
        let client_id = row.i64("client_id").and_then(|id| self.clients.get(id));
        self.destination.execute(
            "UPDATE projects SET color = COALESCE(?1, color), icon = COALESCE(?2, icon),
                 icon_color_mode = COALESCE(?3, icon_color_mode), icon_color = COALESCE(?4, icon_color),
                 client_id = COALESCE(?5, client_id)
             WHERE id = ?6",
            &sql_params![
                color,
                row.non_empty_text("icon"),
                mode.map(IconColorMode::as_str),
                icon_color,
                client_id,
                DEFAULT_PROJECT_ID
            ],
        )?;
        Ok(())
    }

    fn task_id_for(&mut self, name: &str) -> AppResult<i64> {
        if let Some(id) = self.task_names.get(name) {
            return Ok(*id);
        }
        let id = match self.existing_id("tasks", name)? {
            Some(id) => id,
            None => {
                let id = self
                    .destination
                    .execute("INSERT INTO tasks (name) VALUES (?1)", &sql_params![name])?;
                self.summary.tasks_added += 1;
                id
            }
        };
        self.task_names.insert(name.to_string(), id);
        Ok(id)
    }

    pub(crate) fn transfer_tasks(&mut self) -> AppResult<usize> {
        for row in self.source_rows("tasks")? {
            let source_id = required_id(&row, "tasks")?;
            let name = required_name(&row, "tasks", source_id)?;
            let destination_id = self.task_id_for(&name)?;
            self.tasks.insert(source_id, destination_id);
        }
        Ok(self.summary.tasks_added)
    }

    /// Creates tasks for every distinct legacy session name.
    pub(crate) fn transfer_legacy_tasks(&mut self, sessions: &[LegacySession]) -> AppResult<usize> {
        for name in distinct_task_names(sessions) {
            self.task_id_for(&name)?;
        }
        Ok(self.summary.tasks_added)
    }

    pub(crate) fn transfer_instances(&mut self) -> AppResult<usize> {
        for row in self.source_rows("task_instances")? {
            let source_id = required_id(&row, "task_instances")?;
            let Some(task_id) = row.i64("task_id").and_then(|id| self.tasks.get(id)) else {
                tracing::warn!(instance = source_id, "skipping task instance whose task was not transferred");
                continue;
            };
            let project_id = self.projects.resolve_or(row.i64("project_id"), DEFAULT_PROJECT_ID);
            let client_id = self.clients.resolve_or(row.i64("client_id"), DEFAULT_CLIENT_ID);
            let destination_id = self.insert_instance(
                task_id,
                project_id,
                client_id,
                row.non_empty_text("last_used_at").map(canonical_timestamp),
                row.i64("is_favorite").unwrap_or(0) != 0,
            )?;
            self.instances.insert(source_id, destination_id);
        }
        Ok(self.summary.instances_added)
    }

    pub(crate) fn transfer_entries(&mut self) -> AppResult<usize> {
        for row in self.source_rows("time_entries")? {
            let source_id = required_id(&row, "time_entries")?;
            let Some(instance_id) = row.i64("task_instance_id").and_then(|id| self.instances.get(id)) else {
                tracing::warn!(entry = source_id, "skipping time entry whose task instance was not transferred");
                continue;
            };
            let start_time = row.text("start_time").map(canonical_timestamp);
            let end_time = row.text("end_time").map(canonical_timestamp);
            let duration = row.i64("duration");
            if self.insert_entry_if_absent(instance_id, start_time, end_time, duration)? {
                self.summary.entries_added += 1;
            }
        }
        Ok(self.summary.entries_added)
    }

    /// One task instance per legacy session, plus its time entry when the
    /// session carries usable timing, in a single pass.
    pub(crate) fn transfer_legacy_sessions(
        &mut self,
        sessions: &[LegacySession],
        timing: SessionTiming,
    ) -> AppResult<(usize, usize)> {
        for session in sessions {
            let instance_id = self.legacy_instance(session)?;
            self.legacy_entry(instance_id, session, timing)?;
        }
        Ok((self.summary.instances_added, self.summary.entries_added))
    }

    /// Instances only; entries follow via `transfer_legacy_entries`.
    pub(crate) fn transfer_legacy_instances(&mut self, sessions: &[LegacySession]) -> AppResult<usize> {
        for session in sessions {
            let instance_id = self.legacy_instance(session)?;
            self.instances.insert(session.id, instance_id);
        }
        Ok(self.summary.instances_added)
    }

    pub(crate) fn transfer_legacy_entries(
        &mut self,
        sessions: &[LegacySession],
        timing: SessionTiming,
    ) -> AppResult<usize> {
        for session in sessions {
            let Some(instance_id) = self.instances.get(session.id) else {
                tracing::warn!(session = session.id, "skipping legacy session without a task instance");
                continue;
            };
            self.legacy_entry(instance_id, session, timing)?;
        }
        Ok(self.summary.entries_added)
    }

    fn legacy_instance(&mut self, session: &LegacySession) -> AppResult<i64> {
        let task_id = self.task_id_for(&session.name)?;
        let project_id = self.projects.resolve_or(session.project_id, DEFAULT_PROJECT_ID);
        let mapped_client = session.client_id.and_then(|id| self.clients.get(id));
        let client_id = match mapped_client {
            Some(id) => id,
            None => self.project_client(project_id)?.unwrap_or(DEFAULT_CLIENT_ID),
        };
        self.insert_instance(task_id, project_id, client_id, session.last_used_at(), false)
    }

    fn legacy_entry(&mut self, instance_id: i64, session: &LegacySession, timing: SessionTiming) -> AppResult<()> {
        let entry = session
            .time_entry()
            .filter(|entry| timing == SessionTiming::KeepAll || entry.duration > 0);
        if let Some(entry) = entry {
            let inserted = self.insert_entry_if_absent(
                instance_id,
                Some(entry.start_time),
                Some(entry.end_time),
                Some(entry.duration),
            )?;
            if inserted {
                self.summary.entries_added += 1;
            }
        }
        Ok(())
    }

    fn project_client(&mut self, project_id: i64) -> AppResult<Option<i64>> {
        if let Some(client) = self.project_clients.get(&project_id) {
            return Ok(*client);
        }
        let client = self
            .destination
            .query_one("SELECT client_id FROM projects WHERE id = ?1", &sql_params![project_id])?
            .and_then(|row| row.i64("client_id"));
        self.project_clients.insert(project_id, client);
        Ok(client)
    }

    fn insert_instance(
        &mut self,
        task_id: i64,
        project_id: i64,
        client_id: i64,
        last_used_at: Option<String>,
        is_favorite: bool,
    ) -> AppResult<i64> {
        let id = self.destination.execute(
            "INSERT INTO task_instances (task_id, project_id, client_id, total_time, last_used_at, is_favorite)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            &sql_params![task_id, project_id, client_id, last_used_at, is_favorite],
        )?;
        self.summary.instances_added += 1;
        Ok(id)
    }

    /// Returns whether a row was written.
    fn insert_entry_if_absent(
        &self,
        instance_id: i64,
        start_time: Option<String>,
        end_time: Option<String>,
        duration: Option<i64>,
    ) -> AppResult<bool> {
        if let Some(start) = start_time.as_deref() {
            let existing = self.destination.query_one(
                "SELECT id FROM time_entries WHERE task_instance_id = ?1 AND start_time = ?2 LIMIT 1",
                &sql_params![instance_id, start],
            )?;
            if existing.is_some() {
                return Ok(false);
            }
        }
        // A missing start time is left for the NOT NULL constraint to reject.
        self.destination.execute(
            "INSERT INTO time_entries (task_instance_id, start_time, end_time, duration) VALUES (?1, ?2, ?3, ?4)",
            &[
                SqlValue::from(instance_id),
                SqlValue::from(start_time),
                SqlValue::from(end_time),
                SqlValue::from(duration.unwrap_or(0)),
            ],
        )?;
        Ok(true)
    }
}

fn canonical_timestamp(raw: impl AsRef<str>) -> String {
    let raw = raw.as_ref();
    parse_timestamp(raw)
        .map(format_timestamp)
        .unwrap_or_else(|| raw.to_string())
}

fn required_id(row: &Row, table: &str) -> AppResult<i64> {
    row.i64("id")
        .ok_or_else(|| AppError::Import(format!("{} row without an id", table)))
}

fn required_name(row: &Row, table: &str, id: i64) -> AppResult<String> {
    row.non_empty_text("name")
        .ok_or_else(|| AppError::Import(format!("{} row {} has no name", table, id)))
}
