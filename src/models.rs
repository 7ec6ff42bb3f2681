use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Local wall-clock time. Tasks are bucketed by local date, never by UTC offset.
pub type Timestamp = NaiveDateTime;

pub const ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    Done,
    Migrated,
}

impl TaskStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Todo => 0,
            Self::Done => 1,
            Self::Migrated => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Todo),
            1 => Some(Self::Done),
            2 => Some(Self::Migrated),
            _ => None,
        }
    }

    pub fn is_done(self) -> bool {
        self == Self::Done
    }

    pub fn is_migrated(self) -> bool {
        self == Self::Migrated
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Name used in both on-disk generations.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("migrated tasks can not change completion")]
pub struct TransitionError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subtask {
    pub id: String,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl Task {
    pub fn new(id: String, text: &str, priority: Priority, now: Timestamp) -> Self {
        Self {
            id,
            text: normalize_text(text),
            status: TaskStatus::Todo,
            created_at: now,
            completed_at: None,
            priority,
            subtasks: Vec::new(),
        }
    }

    pub fn toggle_done(&mut self, now: Timestamp) -> Result<TaskStatus, TransitionError> {
        toggle_completion(&mut self.status, &mut self.completed_at, now)
    }

    /// Freezes the task as a historical record of an earlier day.
    pub fn mark_migrated(&mut self) {
        self.status = TaskStatus::Migrated;
        self.completed_at = None;
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Todo
    }
}

impl Subtask {
    pub fn new(id: String, text: &str, now: Timestamp) -> Self {
        Self {
            id,
            text: normalize_text(text),
            status: TaskStatus::Todo,
            created_at: now,
            completed_at: None,
            priority: Priority::Normal,
        }
    }

    pub fn toggle_done(&mut self, now: Timestamp) -> Result<TaskStatus, TransitionError> {
        toggle_completion(&mut self.status, &mut self.completed_at, now)
    }
}

fn toggle_completion(
    status: &mut TaskStatus,
    completed_at: &mut Option<Timestamp>,
    now: Timestamp,
) -> Result<TaskStatus, TransitionError> {
    match status {
        TaskStatus::Migrated => Err(TransitionError),
        TaskStatus::Todo => {
            *status = TaskStatus::Done;
            *completed_at = Some(now);
            Ok(*status)
        }
        TaskStatus::Done => {
            *status = TaskStatus::Todo;
            *completed_at = None;
            Ok(*status)
        }
    }
}

/// Brings `completed_at` in line with `status`: done entries always carry a completion time,
/// everything else carries none.
pub fn repair_completion(
    status: TaskStatus,
    created_at: Timestamp,
    completed_at: Option<Timestamp>,
) -> Option<Timestamp> {
    match status {
        TaskStatus::Done => completed_at.or(Some(created_at)),
        TaskStatus::Todo | TaskStatus::Migrated => None,
    }
}

/// Folds line breaks into spaces. Every on-disk generation stores one task per line.
pub fn normalize_text(text: &str) -> String {
    if !text.contains(['\n', '\r']) {
        return text.to_string();
    }
    text.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

pub fn generate_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

/// Generates an id that `taken` does not already contain.
pub fn generate_unique_id(taken: impl Fn(&str) -> bool) -> String {
    loop {
        let id = generate_id();
        if !taken(&id) {
            return id;
        }
    }
}

pub fn contains_id(tasks: &[Task], id: &str) -> bool {
    tasks
        .iter()
        .any(|task| task.id == id || task.subtasks.iter().any(|sub| sub.id == id))
}
