use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::sqlite::SqliteStorage;
use crate::storage::{FileStorage, Storage, StorageError};

pub const ENV_HOME: &str = "DAILY_PLAN_HOME";
pub const ENV_BACKEND: &str = "DAILY_PLAN_BACKEND";

pub const TASKS_FILE: &str = ".daily_plan";
pub const DATABASE_FILE: &str = ".daily_plan.db";
pub const SETTINGS_FILE: &str = ".daily_plan.conf";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown storage backend '{0}' (expected sqlite or file)")]
    UnknownBackend(String),
    #[error("could not determine a home directory; set DAILY_PLAN_HOME")]
    NoHomeDir,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Sqlite,
    File,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "db" => Ok(Self::Sqlite),
            "file" | "flat" => Ok(Self::File),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sqlite => "sqlite",
            Self::File => "file",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub backend: BackendKind,
}

impl AppConfig {
    /// Resolves the configuration: explicit values first, then the environment, then defaults.
    pub fn resolve(
        data_dir: Option<PathBuf>,
        backend: Option<BackendKind>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| env(key).filter(|value| !value.trim().is_empty());
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => match non_empty(ENV_HOME) {
                Some(dir) => PathBuf::from(dir),
                None => dirs::home_dir().ok_or(ConfigError::NoHomeDir)?,
            },
        };
        let backend = match backend {
            Some(backend) => backend,
            None => match non_empty(ENV_BACKEND) {
                Some(value) => value.parse()?,
                None => BackendKind::default(),
            },
        };
        Ok(Self { data_dir, backend })
    }

    pub fn from_env(
        data_dir: Option<PathBuf>,
        backend: Option<BackendKind>,
    ) -> Result<Self, ConfigError> {
        Self::resolve(data_dir, backend, |key| std::env::var(key).ok())
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join(TASKS_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Opens the configured backend, creating the data directory when needed.
    pub fn open_storage(&self) -> Result<Box<dyn Storage + Send>, StorageError> {
        ensure_dir(&self.data_dir)?;
        Ok(match self.backend {
            BackendKind::Sqlite => Box::new(SqliteStorage::open(&self.database_path())?),
            BackendKind::File => {
                Box::new(FileStorage::new(self.tasks_path(), self.settings_path()))
            }
        })
    }
}

fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path)?;
    Ok(())
}
