use crate::errors::AppResult;
use crate::models::{RepairReport, DEFAULT_CLIENT_ID, DEFAULT_PROJECT_ID};
use crate::providers::Store;
use crate::sql_params;

const CLOSE_DUPLICATE_ACTIVE_SQL: &str = "UPDATE time_entries
     SET end_time = start_time, duration = 0
     WHERE end_time IS NULL
       AND EXISTS (
         SELECT 1 FROM time_entries AS newer
         WHERE newer.task_instance_id = time_entries.task_instance_id
           AND newer.end_time IS NULL
           AND newer.id != time_entries.id
           AND (
             julianday(newer.start_time) > julianday(time_entries.start_time)
             OR (julianday(newer.start_time) = julianday(time_entries.start_time) AND newer.id > time_entries.id)
           )
       )";

const COLLAPSE_INVALID_INTERVALS_SQL: &str = "UPDATE time_entries
     SET end_time = start_time, duration = 0
     WHERE end_time IS NOT NULL
       AND julianday(end_time) <= julianday(start_time)
       AND NOT (end_time = start_time AND duration IS NOT NULL AND duration = 0)";

const NORMALIZE_DURATIONS_SQL: &str = "UPDATE time_entries
     SET duration = MAX(0, CAST(strftime('%s', end_time) AS INTEGER) - CAST(strftime('%s', start_time) AS INTEGER))
     WHERE end_time IS NOT NULL
       AND strftime('%s', end_time) IS NOT NULL
       AND strftime('%s', start_time) IS NOT NULL
       AND (
         duration IS NULL
         OR duration < 0
         OR duration != MAX(0, CAST(strftime('%s', end_time) AS INTEGER) - CAST(strftime('%s', start_time) AS INTEGER))
       )";

const RESYNC_INSTANCE_TOTALS_SQL: &str = "UPDATE task_instances
     SET total_time = (
       SELECT COALESCE(SUM(duration), 0) FROM time_entries WHERE task_instance_id = task_instances.id
     )
     WHERE total_time IS NOT (
       SELECT COALESCE(SUM(duration), 0) FROM time_entries WHERE task_instance_id = task_instances.id
     )";

const RESYNC_PROJECT_TOTALS_SQL: &str = "UPDATE projects
     SET total_time = (
       SELECT COALESCE(SUM(total_time), 0) FROM task_instances WHERE project_id = projects.id
     )
     WHERE total_time IS NOT (
       SELECT COALESCE(SUM(total_time), 0) FROM task_instances WHERE project_id = projects.id
     )";

/// Runs the integrity passes in their required order. Closing duplicate
/// active entries must precede the interval pass, which must precede the
/// duration pass. Callers own the surrounding transaction.
pub fn repair_integrity(store: &dyn Store) -> AppResult<RepairReport> {
    let duplicate_active_closed = changed(store.execute(CLOSE_DUPLICATE_ACTIVE_SQL, &[])?);
    let invalid_intervals_collapsed = changed(store.execute(COLLAPSE_INVALID_INTERVALS_SQL, &[])?);
    let durations_normalized = changed(store.execute(NORMALIZE_DURATIONS_SQL, &[])?);
    let totals_resynced = recompute_totals(store)?;

    let report = RepairReport {
        duplicate_active_closed,
        invalid_intervals_collapsed,
        durations_normalized,
        totals_resynced,
    };
    if report.total_changes() > 0 {
        tracing::info!(
            duplicate_active_closed,
            invalid_intervals_collapsed,
            durations_normalized,
            totals_resynced,
            "repaired time entry integrity"
        );
    }
    Ok(report)
}

/// Re-derives `task_instances.total_time` from entry durations, then
/// `projects.total_time` from instance totals. Returns rows changed.
pub fn recompute_totals(store: &dyn Store) -> AppResult<u64> {
    let instances = changed(store.execute(RESYNC_INSTANCE_TOTALS_SQL, &[])?);
    let projects = changed(store.execute(RESYNC_PROJECT_TOTALS_SQL, &[])?);
    Ok(instances + projects)
}

/// Deletes every user row, keeping the reserved default client and project.
pub fn clear_user_data(store: &dyn Store) -> AppResult<()> {
    store.execute("DELETE FROM time_entries", &[])?;
    store.execute("DELETE FROM task_instances", &[])?;
    store.execute("DELETE FROM tasks", &[])?;
    store.execute("DELETE FROM projects WHERE id != ?1", &sql_params![DEFAULT_PROJECT_ID])?;
    store.execute("DELETE FROM clients WHERE id != ?1", &sql_params![DEFAULT_CLIENT_ID])?;
    store.execute(
        "UPDATE projects SET total_time = 0 WHERE id = ?1",
        &sql_params![DEFAULT_PROJECT_ID],
    )?;
    Ok(())
}

fn changed(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}
