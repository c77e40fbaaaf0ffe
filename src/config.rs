use crate::errors::{AppError, AppResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = "timekeep";
pub const DEFAULT_DATABASE_FILE: &str = "time-tracker.db";
pub const DEFAULT_PROVIDER_NAME: &str = "local";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Per-user data directory, resolved from the environment by the host.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = non_empty_env("XDG_DATA_HOME") {
        return PathBuf::from(dir).join(APP_DIR_NAME);
    }
    if let Some(home) = non_empty_env("HOME") {
        return PathBuf::from(home).join(".local").join("share").join(APP_DIR_NAME);
    }
    if let Some(dir) = non_empty_env("APPDATA") {
        return PathBuf::from(dir).join(APP_DIR_NAME);
    }
    PathBuf::from(".").join(APP_DIR_NAME)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Sqlite,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Database file; relative paths resolve against `data_dir`. Defaults
    /// to the main database file.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: Option<PathBuf>,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub database_file: String,
    pub backup_dir: Option<PathBuf>,
    pub active_provider: String,
    pub providers: Vec<ProviderConfig>,
    pub logging: Option<LoggingConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::for_data_dir(default_data_dir())
    }
}

impl StoreConfig {
    /// Defaults rooted at `data_dir` with a single `local` provider.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            backup_dir: None,
            active_provider: DEFAULT_PROVIDER_NAME.to_string(),
            providers: vec![ProviderConfig {
                name: DEFAULT_PROVIDER_NAME.to_string(),
                kind: ProviderKind::Sqlite,
                path: None,
            }],
            logging: None,
        }
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let config = Self::read(path).map_err(|error| AppError::Config(format!("{:#}", error)))?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.database_file.trim().is_empty() {
            return Err(AppError::Config("database_file cannot be empty".to_string()));
        }
        if self.providers.is_empty() {
            return Err(AppError::Config("at least one provider must be configured".to_string()));
        }
        let mut names = BTreeSet::new();
        for provider in &self.providers {
            let name = provider.name.trim();
            if name.is_empty() {
                return Err(AppError::Config("provider names cannot be empty".to_string()));
            }
            if !names.insert(name) {
                return Err(AppError::Config(format!("provider '{}' is configured twice", name)));
            }
        }
        if !names.contains(self.active_provider.trim()) {
            return Err(AppError::Config(format!(
                "active provider '{}' is not configured",
                self.active_provider
            )));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .as_ref()
            .map(|dir| self.resolve(dir))
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    pub fn provider_path(&self, provider: &ProviderConfig) -> PathBuf {
        provider
            .path
            .as_ref()
            .map(|path| self.resolve(path))
            .unwrap_or_else(|| self.database_path())
    }

    pub fn active_provider_config(&self) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|provider| provider.name.trim() == self.active_provider.trim())
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.logging.as_ref().map(|logging| {
            logging
                .dir
                .as_ref()
                .map(|dir| self.resolve(dir))
                .unwrap_or_else(|| self.data_dir.join("logs"))
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}
