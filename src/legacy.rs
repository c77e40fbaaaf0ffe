//! Reading the pre-relational layout, where every `tasks` row is one
//! session carrying its own name, project, client and timing.

use crate::db::catalog::{table_columns, table_exists};
use crate::errors::AppResult;
use crate::models::{format_timestamp, parse_timestamp, Row};
use crate::providers::Store;
use chrono::Duration;
use std::collections::BTreeSet;

pub const LEGACY_SESSION_TABLE: &str = "tasks";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacySession {
    pub id: i64,
    pub name: String,
    pub project_id: Option<i64>,
    pub client_id: Option<i64>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration: Option<i64>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub start_time: String,
    pub end_time: String,
    pub duration: i64,
}

impl LegacySession {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.i64("id")?,
            name: row.non_empty_text("name")?,
            project_id: row.i64("project_id"),
            client_id: row.i64("client_id"),
            start_time: row.non_empty_text("start_time"),
            end_time: row.non_empty_text("end_time"),
            duration: row.i64("duration"),
            created_at: row.non_empty_text("created_at"),
        })
    }

    /// The session's end time, falling back to its creation time and then
    /// its start time.
    pub fn last_used_at(&self) -> Option<String> {
        self.end_time
            .as_deref()
            .or(self.created_at.as_deref())
            .or(self.start_time.as_deref())
            .map(|raw| parse_timestamp(raw).map(format_timestamp).unwrap_or_else(|| raw.to_string()))
    }

    /// Timing to carry into `time_entries`.
    ///
    /// A well-formed start/end pair is copied as is. Otherwise a positive
    /// duration is anchored so that it ends at `last_used_at`. Sessions with
    /// neither produce no entry.
    pub fn time_entry(&self) -> Option<SessionEntry> {
        let start = self.start_time.as_deref().and_then(parse_timestamp);
        let end = self.end_time.as_deref().and_then(parse_timestamp);
        if let (Some(start), Some(end)) = (start, end) {
            if end >= start {
                return Some(SessionEntry {
                    start_time: format_timestamp(start),
                    end_time: format_timestamp(end),
                    duration: (end - start).num_seconds(),
                });
            }
        }

        let duration = self.duration.filter(|seconds| *seconds > 0)?;
        let end = self.last_used_at().as_deref().and_then(parse_timestamp)?;
        let start = end.checked_sub_signed(Duration::try_seconds(duration)?)?;
        Some(SessionEntry {
            start_time: format_timestamp(start),
            end_time: format_timestamp(end),
            duration,
        })
    }
}

/// All legacy session rows in id order. Rows without a usable name are skipped.
pub fn read_sessions(source: &dyn Store) -> AppResult<Vec<LegacySession>> {
    if !table_exists(source, LEGACY_SESSION_TABLE)? {
        return Ok(Vec::new());
    }
    let rows = source.query("SELECT * FROM tasks ORDER BY id ASC", &[])?;
    let sessions: Vec<LegacySession> = rows.iter().filter_map(LegacySession::from_row).collect();
    if sessions.len() != rows.len() {
        tracing::warn!(
            skipped = rows.len() - sessions.len(),
            "skipped legacy sessions without an id or name"
        );
    }
    Ok(sessions)
}

/// Distinct task names in first-seen order.
pub fn distinct_task_names(sessions: &[LegacySession]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    sessions
        .iter()
        .filter(|session| seen.insert(session.name.clone()))
        .map(|session| session.name.clone())
        .collect()
}

/// Whether `source` stores sessions in the legacy `tasks` layout.
pub fn has_session_table(source: &dyn Store) -> AppResult<bool> {
    if !table_exists(source, LEGACY_SESSION_TABLE)? {
        return Ok(false);
    }
    let columns = table_columns(source, LEGACY_SESSION_TABLE)?;
    Ok(columns
        .iter()
        .any(|column| matches!(column.as_str(), "project_id" | "start_time" | "duration")))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::Path;

    /// Writes a pre-relational database: two Design sessions on Website
    /// (client Acme), a duration-only Review session and an untimed one.
    pub(crate) fn write_legacy_database(path: &Path) {
        let conn = rusqlite::Connection::open(path).expect("legacy db");
        conn.execute_batch(
            "CREATE TABLE clients (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE projects (id INTEGER PRIMARY KEY, name TEXT, color TEXT, client_id INTEGER);
             CREATE TABLE tasks (
               id INTEGER PRIMARY KEY,
               name TEXT,
               project_id INTEGER,
               client_id INTEGER,
               start_time TEXT,
               end_time TEXT,
               duration INTEGER,
               created_at TEXT
             );
             INSERT INTO clients VALUES (1, 'Default Client'), (2, 'Acme');
             INSERT INTO projects VALUES (1, 'Default', '#3584e4', NULL), (2, 'Website', '#ffff00', 2);
             INSERT INTO tasks VALUES
               (1, 'Design', 2, NULL, '2024-03-01 09:00:00', '2024-03-01 10:00:00', 3600, '2024-03-01 09:00:00'),
               (2, 'Design', 2, NULL, '2024-03-02 09:00:00', '2024-03-02 09:30:00', 1800, '2024-03-02 09:00:00'),
               (3, 'Review', 1, NULL, NULL, NULL, 600, '2024-03-03 12:00:00'),
               (4, 'Review', 1, NULL, NULL, NULL, 0, '2024-03-04 12:00:00');",
        )
        .expect("legacy fixture");
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::write_legacy_database;
    use super::{distinct_task_names, has_session_table, read_sessions, LegacySession};
    use crate::db::SqliteBackend;

    fn session(start: Option<&str>, end: Option<&str>, duration: Option<i64>, created: Option<&str>) -> LegacySession {
        LegacySession {
            id: 1,
            name: "Design".to_string(),
            project_id: Some(2),
            client_id: None,
            start_time: start.map(ToString::to_string),
            end_time: end.map(ToString::to_string),
            duration,
            created_at: created.map(ToString::to_string),
        }
    }

    #[test]
    fn copies_valid_intervals_directly() {
        let entry = session(Some("2024-03-01 09:00:00"), Some("2024-03-01T10:30:00"), Some(1), None)
            .time_entry()
            .expect("entry");
        assert_eq!(entry.start_time, "2024-03-01 09:00:00");
        assert_eq!(entry.end_time, "2024-03-01 10:30:00");
        assert_eq!(entry.duration, 5400);
    }

    #[test]
    fn reconstructs_start_from_duration_and_last_use() {
        let legacy = session(None, None, Some(900), Some("2024-03-01 12:00:00"));
        assert_eq!(legacy.last_used_at().as_deref(), Some("2024-03-01 12:00:00"));
        let entry = legacy.time_entry().expect("entry");
        assert_eq!(entry.start_time, "2024-03-01 11:45:00");
        assert_eq!(entry.end_time, "2024-03-01 12:00:00");
        assert_eq!(entry.duration, 900);
    }

    #[test]
    fn sessions_without_timing_produce_no_entry() {
        assert!(session(None, None, Some(0), Some("2024-03-01 12:00:00")).time_entry().is_none());
        assert!(session(None, None, Some(60), None).time_entry().is_none());
        assert!(session(Some("garbage"), None, None, None).time_entry().is_none());
    }

    #[test]
    fn out_of_range_durations_produce_no_entry() {
        let huge = session(None, None, Some(i64::MAX), Some("2024-03-01 12:00:00"));
        assert!(huge.time_entry().is_none());
        let before_epoch = session(None, None, Some(i64::MAX / 1_000), Some("2024-03-01 12:00:00"));
        assert!(before_epoch.time_entry().is_none());
    }

    #[test]
    fn distinct_names_keep_first_seen_order() {
        let mut sessions = vec![session(None, None, None, None); 3];
        sessions[1].name = "Review".to_string();
        assert_eq!(distinct_task_names(&sessions), vec!["Design".to_string(), "Review".to_string()]);
    }

    #[test]
    fn reads_sessions_from_a_legacy_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("legacy.db");
        write_legacy_database(&path);
        let source = SqliteBackend::open_read_only(&path).expect("source");

        assert!(has_session_table(&source).expect("layout"));
        let sessions = read_sessions(&source).expect("sessions");
        assert_eq!(sessions.len(), 4);
        assert_eq!(sessions[0].project_id, Some(2));
        assert_eq!(sessions[2].start_time, None);
        assert_eq!(sessions[2].duration, Some(600));
    }
}
