//! Relational task store.
//!
//! Every save rewrites the `tasks` table inside one transaction, so a failed save rolls back to
//! the previous forest.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::codec::{decode_priority, format_timestamp, parse_timestamp, DecodeError, DecodeSkip};
use crate::forest::{assemble, flatten, FlatRecord, ParentRef};
use crate::models::{repair_completion, Task, TaskStatus, Timestamp};
use crate::settings::SettingKey;
use crate::storage::{LoadedTasks, Storage, StorageError};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    text TEXT,
    is_done INTEGER NOT NULL DEFAULT 0,
    is_migrated INTEGER NOT NULL DEFAULT 0,
    created_at TEXT,
    completed_at TEXT,
    priority TEXT,
    parent_id TEXT
);

CREATE TABLE IF NOT EXISTS settings (
    conf_key TEXT PRIMARY KEY,
    conf_value TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
"#;

const SELECT_TASKS: &str = "SELECT id, text, is_done, is_migrated, created_at, completed_at, \
     priority, parent_id FROM tasks ORDER BY rowid";

const INSERT_TASK: &str = "INSERT INTO tasks \
     (id, text, is_done, is_migrated, created_at, completed_at, priority, parent_id) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

pub struct SqliteStorage {
    conn: Connection,
    label: String,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, format!("sqlite {}", path.display()))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?, "sqlite :memory:".to_string())
    }

    fn init(conn: Connection, label: String) -> Result<Self, StorageError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, label })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Raw column values of one `tasks` row.
struct TaskRow {
    id: Option<String>,
    text: Option<String>,
    is_done: bool,
    is_migrated: bool,
    created_at: Option<String>,
    completed_at: Option<String>,
    priority: Option<String>,
    parent_id: Option<String>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            is_done: row.get::<_, Option<bool>>(2)?.unwrap_or(false),
            is_migrated: row.get::<_, Option<bool>>(3)?.unwrap_or(false),
            created_at: row.get(4)?,
            completed_at: row.get(5)?,
            priority: row.get(6)?,
            parent_id: row.get(7)?,
        })
    }

    fn into_record(self, now: Timestamp) -> Result<FlatRecord, DecodeError> {
        let status = if self.is_migrated {
            TaskStatus::Migrated
        } else if self.is_done {
            TaskStatus::Done
        } else {
            TaskStatus::Todo
        };
        let created_at = match self.created_at.as_deref() {
            Some(value) => parse_timestamp(value)?,
            None => now,
        };
        let completed_at = self
            .completed_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        Ok(FlatRecord {
            id: self.id,
            text: self.text.unwrap_or_default(),
            status,
            created_at,
            completed_at: repair_completion(status, created_at, completed_at),
            priority: self.priority.as_deref().map(decode_priority).unwrap_or_default(),
            parent: match self.parent_id {
                Some(parent_id) => ParentRef::Id(parent_id),
                None => ParentRef::None,
            },
        })
    }
}

impl Storage for SqliteStorage {
    fn load_tasks(&mut self, now: Timestamp) -> Result<LoadedTasks, StorageError> {
        let mut stmt = self.conn.prepare(SELECT_TASKS)?;
        let rows = stmt.query_map([], |row| {
            let row_id = row.get::<_, Option<String>>(0).ok().flatten();
            Ok((row_id, TaskRow::read(row)))
        })?;

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        for (index, row) in rows.enumerate() {
            let (row_id, read) = row?;
            let location = row_id.unwrap_or_else(|| format!("row {}", index + 1));
            let decoded = read
                .map_err(|err| DecodeError::Column(err.to_string()))
                .and_then(|task_row| task_row.into_record(now));
            match decoded {
                Ok(record) => records.push(record),
                Err(error) => {
                    log::warn!("skipping malformed task row {location}: {error}");
                    skipped.push(DecodeSkip { location, error });
                }
            }
        }

        Ok(LoadedTasks {
            tasks: assemble(records),
            skipped,
        })
    }

    fn save_tasks(&mut self, tasks: &[Task]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tasks", [])?;
        {
            let mut insert = tx.prepare(INSERT_TASK)?;
            for record in flatten(tasks) {
                let parent_id = match &record.parent {
                    ParentRef::Id(id) => Some(id.as_str()),
                    ParentRef::None | ParentRef::Previous => None,
                };
                insert.execute(params![
                    record.id,
                    record.text,
                    record.status.is_done(),
                    record.status.is_migrated(),
                    format_timestamp(&record.created_at),
                    record.completed_at.as_ref().map(format_timestamp),
                    record.priority.as_str(),
                    parent_id,
                ])?;
            }
        }
        // Dropping an uncommitted transaction rolls it back.
        tx.commit()?;
        Ok(())
    }

    fn load_setting(&mut self, key: SettingKey) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT conf_value FROM settings WHERE conf_key = ?1",
                params![key.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn save_setting(&mut self, key: SettingKey, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO settings (conf_key, conf_value) VALUES (?1, ?2) \
             ON CONFLICT(conf_key) DO UPDATE SET conf_value = excluded.conf_value",
            params![key.as_str(), value],
        )?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
