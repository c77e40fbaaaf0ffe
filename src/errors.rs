use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONNECTION_FAILED: {0}")]
    Connection(String),
    #[error("QUERY_FAILED: {message} [sql: {sql}]")]
    Query { sql: String, message: String },
    #[error("EXECUTE_FAILED: {message} [sql: {sql}]")]
    Execute { sql: String, message: String },
    #[error("TRANSACTION_FAILED: {0}")]
    Transaction(String),
    #[error("NO_ACTIVE_PROVIDER: no storage provider is active")]
    NoActiveProvider,
    #[error("PROVIDER_SWITCH_FAILED: {name}: {reason}")]
    ProviderSwitch { name: String, reason: String },
    #[error("PROVIDER_INVALID: {0}")]
    InvalidProvider(String),
    #[error("MIGRATION_FAILED: {0}")]
    Migration(String),
    #[error("IMPORT_FAILED: {0}")]
    Import(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn query(sql: &str, error: impl std::fmt::Display) -> Self {
        Self::Query {
            sql: sql.to_string(),
            message: error.to_string(),
        }
    }

    pub fn execute(sql: &str, error: impl std::fmt::Display) -> Self {
        Self::Execute {
            sql: sql.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
