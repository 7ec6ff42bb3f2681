use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec::{decode_lines, encode_lines, DecodeSkip};
use crate::forest::{assemble, flatten};
use crate::models::{Task, Timestamp};
use crate::settings::{encode_properties, parse_properties, SettingKey};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// A queued write failed or the writer is gone; the message is the underlying cause.
    #[error("background write failed: {0}")]
    Writer(String),
}

/// Result of reading the backing medium.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadedTasks {
    pub tasks: Vec<Task>,
    pub skipped: Vec<DecodeSkip>,
}

/// A backing medium for the task forest and the settings table.
pub trait Storage {
    /// Reads the full forest. A medium that does not exist yet yields an empty forest.
    fn load_tasks(&mut self, now: Timestamp) -> Result<LoadedTasks, StorageError>;

    /// Replaces the persisted forest. Readers observe either the old or the new forest.
    fn save_tasks(&mut self, tasks: &[Task]) -> Result<(), StorageError>;

    fn load_setting(&mut self, key: SettingKey) -> Result<Option<String>, StorageError>;

    fn save_setting(&mut self, key: SettingKey, value: &str) -> Result<(), StorageError>;

    fn describe(&self) -> String;
}

/// Line-oriented task file plus a `key=value` settings file.
pub struct FileStorage {
    tasks_path: PathBuf,
    settings_path: PathBuf,
}

impl FileStorage {
    pub fn new(tasks_path: PathBuf, settings_path: PathBuf) -> Self {
        Self {
            tasks_path,
            settings_path,
        }
    }

    pub fn tasks_path(&self) -> &Path {
        &self.tasks_path
    }

    fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn load_properties(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match read_optional(&self.settings_path)? {
            Some(content) => Ok(parse_properties(&content)),
            None => Ok(BTreeMap::new()),
        }
    }
}

impl Storage for FileStorage {
    fn load_tasks(&mut self, now: Timestamp) -> Result<LoadedTasks, StorageError> {
        let Some(content) = read_optional(&self.tasks_path)? else {
            log::debug!("no task file at {}", self.tasks_path.display());
            return Ok(LoadedTasks::default());
        };
        Ok(load_flat_content(&content, now))
    }

    fn save_tasks(&mut self, tasks: &[Task]) -> Result<(), StorageError> {
        Self::ensure_parent(&self.tasks_path)?;
        let content = encode_lines(&flatten(tasks));
        write_atomic(&self.tasks_path, content.as_bytes())
    }

    fn load_setting(&mut self, key: SettingKey) -> Result<Option<String>, StorageError> {
        Ok(self.load_properties()?.remove(key.as_str()))
    }

    fn save_setting(&mut self, key: SettingKey, value: &str) -> Result<(), StorageError> {
        let mut map = self.load_properties()?;
        map.insert(key.as_str().to_string(), value.to_string());
        Self::ensure_parent(&self.settings_path)?;
        write_atomic(&self.settings_path, encode_properties(&map).as_bytes())
    }

    fn describe(&self) -> String {
        format!("flat file {}", self.tasks_path.display())
    }
}

/// Decodes flat-file content of any generation into a forest.
pub fn load_flat_content(content: &str, now: Timestamp) -> LoadedTasks {
    let decoded = decode_lines(content, now);
    LoadedTasks {
        tasks: assemble(decoded.records),
        skipped: decoded.skipped,
    }
}

/// Reads a file as text, `None` when it does not exist. Invalid UTF-8 is replaced rather
/// than failing the whole read.
pub fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Writes to a sibling temp file and renames it over `path`, so the live file is never
/// truncated by a failed write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = temp_path_for(path);
    let result = (|| -> Result<(), StorageError> {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
