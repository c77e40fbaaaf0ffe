pub mod registry;

use crate::errors::AppResult;
use crate::models::{Row, SqlValue, SCHEMA_VERSION_KEY};
use std::path::PathBuf;

pub use registry::ProviderRegistry;

/// Data-plane operations shared by every backend and by the registry that
/// routes to the active one.
pub trait Store: Send + Sync {
    fn query(&self, sql: &str, params: &[SqlValue]) -> AppResult<Vec<Row>>;

    /// Runs a mutating statement. Returns the generated rowid for
    /// `INSERT`/`REPLACE`, otherwise the number of changed rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> AppResult<i64>;

    fn begin_transaction(&self) -> AppResult<()>;
    fn commit(&self) -> AppResult<()>;
    fn rollback(&self) -> AppResult<()>;

    fn metadata(&self, key: &str) -> AppResult<Option<String>>;
    fn set_metadata(&self, key: &str, value: &str) -> AppResult<()>;

    fn query_one(&self, sql: &str, params: &[SqlValue]) -> AppResult<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// `0` when no version has been recorded yet.
    fn schema_version(&self) -> AppResult<i64> {
        Ok(self
            .metadata(SCHEMA_VERSION_KEY)?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0))
    }

    fn set_schema_version(&self, version: i64) -> AppResult<()> {
        self.set_metadata(SCHEMA_VERSION_KEY, &version.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub connect: bool,
    pub query: bool,
    pub execute: bool,
    pub transactions: bool,
    pub metadata: bool,
    pub schema_version: bool,
}

impl Capabilities {
    pub const FULL: Self = Self {
        connect: true,
        query: true,
        execute: true,
        transactions: true,
        metadata: true,
        schema_version: true,
    };

    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.connect, "connect"),
            (self.query, "query"),
            (self.execute, "execute"),
            (self.transactions, "transactions"),
            (self.metadata, "metadata"),
            (self.schema_version, "schema_version"),
        ]
        .into_iter()
        .filter(|(present, _)| !present)
        .map(|(_, name)| name)
        .collect()
    }
}

/// A connectable storage backend that can be registered as a provider.
pub trait StorageBackend: Store {
    fn name(&self) -> &str;
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    /// Opens the connection and bootstraps the schema. Calling it on a
    /// connected backend is a no-op.
    fn initialize(&self) -> AppResult<()>;
    fn is_connected(&self) -> bool;
    fn in_transaction(&self) -> bool;

    /// Round-trips a trivial statement through the connection.
    fn ping(&self) -> AppResult<()> {
        self.query("SELECT 1 AS ok", &[]).map(|_| ())
    }

    /// Releases the connection. Safe to call repeatedly.
    fn close(&self);

    fn database_path(&self) -> Option<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::Capabilities;

    #[test]
    fn full_capabilities_have_nothing_missing() {
        assert!(Capabilities::FULL.missing().is_empty());
    }

    #[test]
    fn reports_missing_capabilities_by_name() {
        let partial = Capabilities {
            transactions: false,
            metadata: false,
            ..Capabilities::FULL
        };
        assert_eq!(partial.missing(), vec!["transactions", "metadata"]);
    }
}
