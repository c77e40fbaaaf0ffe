use crate::errors::AppResult;
use crate::providers::Store;
use crate::sql_params;

pub fn table_exists(store: &dyn Store, table: &str) -> AppResult<bool> {
    let rows = store.query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
        &sql_params![table],
    )?;
    Ok(!rows.is_empty())
}

pub fn table_columns(store: &dyn Store, table: &str) -> AppResult<Vec<String>> {
    let rows = store.query("SELECT name FROM pragma_table_info(?1)", &sql_params![table])?;
    Ok(rows
        .iter()
        .filter_map(|row| row.text("name").map(ToString::to_string))
        .collect())
}

pub fn count_rows(store: &dyn Store, table: &str) -> AppResult<i64> {
    if !table_exists(store, table)? {
        return Ok(0);
    }
    // Table names cannot be bound; only names confirmed by sqlite_master reach here.
    let sql = format!("SELECT COUNT(1) AS total FROM \"{}\"", table.replace('"', "\"\""));
    Ok(store
        .query_one(&sql, &[])?
        .and_then(|row| row.i64("total"))
        .unwrap_or(0))
}
