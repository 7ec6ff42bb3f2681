use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, NaiveDate};

use crate::clock::{Clock, SystemClock};
use crate::events::{Listener, StatePayload, StoreEvent};
use crate::migration::{self, MigrationReport};
use crate::models::{
    contains_id, generate_unique_id, normalize_text, repair_completion, Priority, Subtask, Task,
    TaskStatus, Timestamp,
};
use crate::report::{self, TaskView};
use crate::settings::SettingKey;
use crate::storage::{LoadedTasks, Storage, StorageError};
use crate::writer::{shared, SharedStorage, WriteQueue};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no task matches '{0}'")]
    NotFound(String),
    #[error("task {0} is migrated and can not change completion")]
    InvalidTransition(String),
}

/// How mutations reach the backing medium.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Each mutation is written before the call returns.
    #[default]
    Immediate,
    /// Mutations enqueue a snapshot for the background writer; see [`TaskStore::flush`].
    Queued,
}

#[derive(Clone)]
pub struct StoreOptions {
    pub clock: Arc<dyn Clock>,
    pub write_mode: WriteMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            write_mode: WriteMode::Immediate,
        }
    }
}

enum Sink {
    Immediate(SharedStorage),
    Queued {
        storage: SharedStorage,
        queue: WriteQueue,
    },
}

impl Sink {
    fn storage(&self) -> &SharedStorage {
        match self {
            Self::Immediate(storage) => storage,
            Self::Queued { storage, .. } => storage,
        }
    }
}

struct StoreData {
    tasks: Vec<Task>,
    settings: BTreeMap<SettingKey, String>,
}

/// Position of a task or subtask inside the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    task: usize,
    sub: Option<usize>,
}

/// Owns the task forest and mediates every read and write of the backing medium.
///
/// Snapshots are handed to the storage (or the write queue) while the state lock is held, so
/// the order of persisted snapshots always matches the order of mutations.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Mutex<StoreData>>,
    sink: Arc<Sink>,
    clock: Arc<dyn Clock>,
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl TaskStore {
    /// Creates a store over `storage` and loads the persisted forest.
    pub fn open(storage: Box<dyn Storage + Send>) -> Result<Self, StoreError> {
        Self::open_with(storage, StoreOptions::default())
    }

    pub fn open_with(
        storage: Box<dyn Storage + Send>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let store = Self::new(storage, options)?;
        store.load()?;
        Ok(store)
    }

    /// Creates a store with an empty in-memory forest. Nothing is read until [`TaskStore::load`].
    pub fn new(
        storage: Box<dyn Storage + Send>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let storage = shared(storage);
        let sink = match options.write_mode {
            WriteMode::Immediate => Sink::Immediate(storage),
            WriteMode::Queued => Sink::Queued {
                queue: WriteQueue::spawn(storage.clone())?,
                storage,
            },
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreData {
                tasks: Vec::new(),
                settings: BTreeMap::new(),
            })),
            sink: Arc::new(sink),
            clock: options.clock,
            listeners: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Replaces the in-memory forest with the persisted one. Pending queued writes land first.
    pub fn load(&self) -> Result<LoadedTasks, StoreError> {
        let mut guard = self.lock();
        if let Sink::Queued { queue, .. } = self.sink.as_ref() {
            queue.flush()?;
        }
        let loaded = {
            let mut storage = self.lock_storage();
            let loaded = storage.load_tasks(self.clock.now())?;
            log::info!(
                "loaded {} tasks from {} ({} skipped)",
                loaded.tasks.len(),
                storage.describe(),
                loaded.skipped.len()
            );
            loaded
        };
        guard.tasks = loaded.tasks.clone();
        drop(guard);
        self.emit(&StoreEvent::Loaded {
            count: loaded.tasks.len(),
            skipped: loaded.skipped.len(),
        });
        Ok(loaded)
    }

    /// Replaces the whole forest and persists it. Text is normalized, completion times are
    /// brought in line with status and duplicate ids are reassigned.
    pub fn save(&self, tasks: Vec<Task>) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let mut taken = HashSet::new();
        guard.tasks = tasks
            .into_iter()
            .map(|task| sanitize(task, &mut taken))
            .collect();
        let count = guard.tasks.len();
        self.commit(guard, StoreEvent::Replaced { count }, ())
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    /// The top-level task that is, or owns, the entry matching `id`.
    pub fn task(&self, id: &str) -> Option<Task> {
        let guard = self.lock();
        let location = locate(&guard.tasks, id)?;
        Some(guard.tasks[location.task].clone())
    }

    /// Full id of the entry `id` addresses: an exact match first, then the first prefix match.
    pub fn resolve_id(&self, id: &str) -> Option<String> {
        let guard = self.lock();
        let location = locate(&guard.tasks, id)?;
        let task = &guard.tasks[location.task];
        Some(match location.sub {
            Some(sub) => task.subtasks[sub].id.clone(),
            None => task.id.clone(),
        })
    }

    pub fn add_task(&self, text: &str, priority: Priority) -> Result<Task, StoreError> {
        let mut guard = self.lock();
        let id = generate_unique_id(|candidate| contains_id(&guard.tasks, candidate));
        let task = Task::new(id, text, priority, self.clock.now());
        guard.tasks.push(task.clone());
        log::debug!("added task {}", task.id);
        let event = StoreEvent::TaskAdded {
            id: task.id.clone(),
        };
        self.commit(guard, event, task)
    }

    /// Attaches a subtask to the first top-level task, in forest order, whose id starts with
    /// `parent_prefix`.
    pub fn add_subtask(&self, parent_prefix: &str, text: &str) -> Result<Subtask, StoreError> {
        let prefix = parent_prefix.trim();
        let mut guard = self.lock();
        let parent = guard
            .tasks
            .iter()
            .position(|task| !prefix.is_empty() && task.id.starts_with(prefix))
            .ok_or_else(|| StoreError::NotFound(prefix.to_string()))?;
        let id = generate_unique_id(|candidate| contains_id(&guard.tasks, candidate));
        let subtask = Subtask::new(id, text, self.clock.now());
        let parent_id = guard.tasks[parent].id.clone();
        guard.tasks[parent].subtasks.push(subtask.clone());
        log::debug!("added subtask {} under {parent_id}", subtask.id);
        let event = StoreEvent::SubtaskAdded {
            parent_id,
            id: subtask.id.clone(),
        };
        self.commit(guard, event, subtask)
    }

    /// Flips a task or subtask between `Todo` and `Done`. Migrated entries are rejected and
    /// nothing is written.
    pub fn toggle_done(&self, id: &str) -> Result<TaskStatus, StoreError> {
        let mut guard = self.lock();
        let location = self.find(&guard.tasks, id)?;
        let now = self.clock.now();
        let task = &mut guard.tasks[location.task];
        let (entry_id, toggled) = match location.sub {
            Some(sub) => {
                let subtask = &mut task.subtasks[sub];
                (subtask.id.clone(), subtask.toggle_done(now))
            }
            None => (task.id.clone(), task.toggle_done(now)),
        };
        let status = toggled.map_err(|_| StoreError::InvalidTransition(entry_id.clone()))?;
        self.commit(guard, StoreEvent::TaskUpdated { id: entry_id }, status)
    }

    pub fn update_text(&self, id: &str, text: &str) -> Result<(), StoreError> {
        let text = normalize_text(text);
        self.update(id, |current, _| *current = text)
    }

    pub fn update_priority(&self, id: &str, priority: Priority) -> Result<(), StoreError> {
        self.update(id, |_, current| *current = priority)
    }

    /// Removes a top-level task with all of its subtasks, or a single subtask.
    pub fn remove_task(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let location = self.find(&guard.tasks, id)?;
        let removed = match location.sub {
            Some(sub) => guard.tasks[location.task].subtasks.remove(sub).id,
            None => guard.tasks.remove(location.task).id,
        };
        log::debug!("removed task {removed}");
        self.commit(guard, StoreEvent::TaskRemoved { id: removed }, ())
    }

    pub fn clear_all(&self) -> Result<(), StoreError> {
        let mut guard = self.lock();
        guard.tasks.clear();
        self.commit(guard, StoreEvent::Cleared, ())
    }

    /// Rolls yesterday's unfinished tasks forward to today, persisting once for the batch.
    /// Nothing is written when there is nothing to migrate.
    pub fn migrate(&self) -> Result<MigrationReport, StoreError> {
        let mut guard = self.lock();
        let report = migration::apply(&mut guard.tasks, self.clock.now());
        if report.is_empty() {
            log::info!("nothing to migrate");
            return Ok(report);
        }
        log::info!("migrated {} tasks from yesterday", report.count());
        let event = StoreEvent::Migrated {
            count: report.count(),
        };
        self.commit(guard, event, report)
    }

    /// Removes done tasks and subtasks completed more than `days` days ago.
    pub fn purge_completed(&self, days: u32) -> Result<usize, StoreError> {
        let cutoff = Duration::try_days(i64::from(days))
            .and_then(|window| self.clock.now().checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            log::debug!("purge window of {days} days is out of range");
            return Ok(0);
        };
        let expired = |status: TaskStatus, completed_at: Option<Timestamp>| {
            status == TaskStatus::Done && completed_at.is_some_and(|at| at < cutoff)
        };

        let mut guard = self.lock();
        let mut removed = 0;
        guard.tasks.retain_mut(|task| {
            if expired(task.status, task.completed_at) {
                removed += 1 + task.subtasks.len();
                return false;
            }
            let before = task.subtasks.len();
            task.subtasks
                .retain(|sub| !expired(sub.status, sub.completed_at));
            removed += before - task.subtasks.len();
            true
        });
        if removed == 0 {
            return Ok(0);
        }
        log::info!("purged {removed} completed tasks older than {days} days");
        self.commit(guard, StoreEvent::Purged { count: removed }, removed)
    }

    /// Appends `tasks` to the forest, reassigning any id that is already in use.
    pub fn import_tasks(&self, tasks: Vec<Task>) -> Result<usize, StoreError> {
        let mut guard = self.lock();
        let mut taken: HashSet<String> = HashSet::new();
        for task in &guard.tasks {
            taken.insert(task.id.clone());
            taken.extend(task.subtasks.iter().map(|sub| sub.id.clone()));
        }
        let count = tasks.len();
        for task in tasks {
            let task = sanitize(task, &mut taken);
            guard.tasks.push(task);
        }
        if count == 0 {
            return Ok(0);
        }
        self.commit(guard, StoreEvent::Imported { count }, count)
    }

    pub fn theme(&self) -> String {
        self.setting(SettingKey::Theme)
    }

    pub fn set_theme(&self, theme: &str) -> Result<(), StoreError> {
        self.set_setting(SettingKey::Theme, theme)
    }

    /// Reads a setting, falling back to its default when absent or unreadable.
    pub fn setting(&self, key: SettingKey) -> String {
        let mut guard = self.lock();
        if let Some(value) = guard.settings.get(&key) {
            return value.clone();
        }
        let value = match self.lock_storage().load_setting(key) {
            Ok(Some(value)) => value,
            Ok(None) => key.default_value().to_string(),
            Err(err) => {
                log::warn!("failed to read setting {}: {err}", key.as_str());
                return key.default_value().to_string();
            }
        };
        guard.settings.insert(key, value.clone());
        value
    }

    /// Stores a setting. The new value is kept in memory even when the write fails.
    pub fn set_setting(&self, key: SettingKey, value: &str) -> Result<(), StoreError> {
        let mut guard = self.lock();
        guard.settings.insert(key, value.to_string());
        let result = self.lock_storage().save_setting(key, value);
        if let Err(err) = &result {
            log::warn!("failed to save setting {}: {err}", key.as_str());
        }
        Ok(result?)
    }

    /// Read-only view of the forest for the report collaborator.
    pub fn snapshot(&self) -> Vec<TaskView> {
        report::snapshot(&self.lock().tasks)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().tasks.iter().filter(|task| task.is_pending()).count()
    }

    pub fn state_payload(&self) -> StatePayload {
        let tasks = self.tasks();
        let pending = tasks.iter().filter(|task| task.is_pending()).count();
        StatePayload {
            tasks,
            theme: self.theme(),
            pending,
        }
    }

    pub fn subscribe(&self, listener: Listener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Waits for queued writes to reach the backing medium. Immediate stores have nothing to do.
    pub fn flush(&self) -> Result<(), StoreError> {
        match self.sink.as_ref() {
            Sink::Immediate(_) => Ok(()),
            Sink::Queued { queue, .. } => Ok(queue.flush()?),
        }
    }

    pub fn describe(&self) -> String {
        self.lock_storage().describe()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut String, &mut Priority),
    ) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let location = self.find(&guard.tasks, id)?;
        let task = &mut guard.tasks[location.task];
        let entry_id = match location.sub {
            Some(sub) => {
                let subtask = &mut task.subtasks[sub];
                apply(&mut subtask.text, &mut subtask.priority);
                subtask.id.clone()
            }
            None => {
                apply(&mut task.text, &mut task.priority);
                task.id.clone()
            }
        };
        self.commit(guard, StoreEvent::TaskUpdated { id: entry_id }, ())
    }

    fn find(&self, tasks: &[Task], id: &str) -> Result<Location, StoreError> {
        locate(tasks, id).ok_or_else(|| StoreError::NotFound(id.trim().to_string()))
    }

    /// Persists the current forest, releases the state lock, then notifies listeners. The
    /// in-memory change stands even when the write fails.
    fn commit<T>(
        &self,
        guard: MutexGuard<'_, StoreData>,
        event: StoreEvent,
        value: T,
    ) -> Result<T, StoreError> {
        let outcome = self.persist(&guard.tasks);
        drop(guard);
        self.emit(&event);
        outcome.map(|()| value)
    }

    fn persist(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let result = match self.sink.as_ref() {
            Sink::Immediate(storage) => storage
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .save_tasks(tasks),
            Sink::Queued { queue, .. } => queue.enqueue(tasks.to_vec()),
        };
        if let Err(err) = &result {
            log::error!("failed to persist {} tasks: {err}", tasks.len());
        }
        Ok(result?)
    }

    fn emit(&self, event: &StoreEvent) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_storage(&self) -> MutexGuard<'_, Box<dyn Storage + Send>> {
        self.sink
            .storage()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exact id first, then the first id in forest order that starts with `id`.
fn locate(tasks: &[Task], id: &str) -> Option<Location> {
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    locate_by(tasks, |candidate| candidate == id)
        .or_else(|| locate_by(tasks, |candidate| candidate.starts_with(id)))
}

fn locate_by(tasks: &[Task], matches: impl Fn(&str) -> bool) -> Option<Location> {
    for (task_index, task) in tasks.iter().enumerate() {
        if matches(&task.id) {
            return Some(Location {
                task: task_index,
                sub: None,
            });
        }
        if let Some(sub) = task.subtasks.iter().position(|sub| matches(&sub.id)) {
            return Some(Location {
                task: task_index,
                sub: Some(sub),
            });
        }
    }
    None
}

/// Brings an externally supplied task in line with the forest invariants. Ids already in
/// `taken` (or empty ones) are replaced; every id used is added to `taken`.
fn sanitize(mut task: Task, taken: &mut HashSet<String>) -> Task {
    task.id = claim_id(std::mem::take(&mut task.id), taken);
    task.text = normalize_text(&task.text);
    task.completed_at = repair_completion(task.status, task.created_at, task.completed_at);
    for sub in &mut task.subtasks {
        sub.id = claim_id(std::mem::take(&mut sub.id), taken);
        sub.text = normalize_text(&sub.text);
        sub.completed_at = repair_completion(sub.status, sub.created_at, sub.completed_at);
    }
    task
}

fn claim_id(id: String, taken: &mut HashSet<String>) -> String {
    let id = if id.trim().is_empty() || taken.contains(&id) {
        if !id.is_empty() {
            log::warn!("task id {id} is already in use; assigning a fresh id");
        }
        generate_unique_id(|candidate| taken.contains(candidate))
    } else {
        id
    };
    taken.insert(id.clone());
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::sqlite::SqliteStorage;
    use crate::storage::FileStorage;
    use std::path::Path;

    fn at(day: u32, hour: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2024, 10, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn options(clock: &Arc<FixedClock>, write_mode: WriteMode) -> StoreOptions {
        StoreOptions {
            clock: clock.clone(),
            write_mode,
        }
    }

    fn sqlite_store(dir: &Path, clock: &Arc<FixedClock>) -> TaskStore {
        let storage = SqliteStorage::open(&dir.join("tasks.db")).unwrap();
        TaskStore::open_with(Box::new(storage), options(clock, WriteMode::Immediate)).unwrap()
    }

    fn file_store(dir: &Path, clock: &Arc<FixedClock>, write_mode: WriteMode) -> TaskStore {
        let storage = FileStorage::new(dir.join(".daily_plan"), dir.join(".daily_plan.conf"));
        TaskStore::open_with(Box::new(storage), options(clock, write_mode)).unwrap()
    }

    fn task_with_id(id: &str, text: &str, created_at: Timestamp) -> Task {
        Task::new(id.to_string(), text, Priority::Normal, created_at)
    }

    #[test]
    fn missing_backing_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = file_store(dir.path(), &clock, WriteMode::Immediate);
        assert!(store.tasks().is_empty());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn saved_forest_reloads_with_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        for file_backed in [false, true] {
            let sub = dir.path().join(if file_backed { "file" } else { "db" });
            std::fs::create_dir_all(&sub).unwrap();
            let make = || {
                if file_backed {
                    file_store(&sub, &clock, WriteMode::Immediate)
                } else {
                    sqlite_store(&sub, &clock)
                }
            };
            let store = make();
            let forest = vec![task_with_id("5e1f0a2b", "buy milk", at(15, 8))];
            store.save(forest.clone()).unwrap();

            let reopened = make();
            assert_eq!(reopened.tasks(), forest);
        }
    }

    #[test]
    fn add_subtask_attaches_by_prefix_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        store
            .save(vec![
                task_with_id("99990000", "other", at(15, 7)),
                task_with_id("1a2b3c4d", "deploy", at(15, 8)),
            ])
            .unwrap();

        let subtask = store.add_subtask("1a2b", "check logs").unwrap();
        assert_eq!(subtask.text, "check logs");
        assert_eq!(subtask.status, TaskStatus::Todo);

        let reopened = sqlite_store(dir.path(), &clock);
        let parent = reopened.task("1a2b3c4d").unwrap();
        assert_eq!(parent.subtasks.len(), 1);
        assert_eq!(parent.subtasks[0].id, subtask.id);
        assert!(reopened.task("99990000").unwrap().subtasks.is_empty());
    }

    #[test]
    fn add_subtask_without_match_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        store.add_task("only", Priority::Normal).unwrap();
        assert!(matches!(
            store.add_subtask("zzzz", "x"),
            Err(StoreError::NotFound(prefix)) if prefix == "zzzz"
        ));
        assert!(matches!(store.add_subtask("  ", "x"), Err(StoreError::NotFound(_))));
        assert_eq!(store.tasks()[0].subtasks.len(), 0);
    }

    #[test]
    fn prefix_tie_break_is_forest_order() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        store
            .save(vec![
                task_with_id("abcd0001", "first", at(15, 7)),
                task_with_id("abcd0002", "second", at(15, 8)),
            ])
            .unwrap();
        store.add_subtask("abcd", "child").unwrap();
        assert_eq!(store.tasks()[0].subtasks.len(), 1);
        assert!(store.tasks()[1].subtasks.is_empty());
    }

    #[test]
    fn toggle_sets_and_clears_completion() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        let task = store.add_task("write report", Priority::High).unwrap();

        clock.set(at(15, 11));
        assert_eq!(store.toggle_done(&task.id).unwrap(), TaskStatus::Done);
        let done = store.task(&task.id).unwrap();
        assert_eq!(done.completed_at, Some(at(15, 11)));

        assert_eq!(store.toggle_done(&task.id).unwrap(), TaskStatus::Todo);
        assert_eq!(store.task(&task.id).unwrap().completed_at, None);

        let sub = store.add_subtask(&task.id, "proofread").unwrap();
        assert_eq!(store.toggle_done(&sub.id).unwrap(), TaskStatus::Done);
        let parent = store.task(&task.id).unwrap();
        assert_eq!(parent.status, TaskStatus::Todo);
        assert_eq!(parent.subtasks[0].status, TaskStatus::Done);
    }

    #[test]
    fn toggle_on_migrated_task_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        let mut old = task_with_id("0ld00001", "history", at(14, 9));
        old.mark_migrated();
        store.save(vec![old]).unwrap();

        assert!(matches!(
            store.toggle_done("0ld00001"),
            Err(StoreError::InvalidTransition(id)) if id == "0ld00001"
        ));
        let task = store.task("0ld00001").unwrap();
        assert_eq!(task.status, TaskStatus::Migrated);
        assert_eq!(task.completed_at, None);
    }

    #[test]
    fn updates_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        let task = store.add_task("draft", Priority::Normal).unwrap();
        let keep = store.add_subtask(&task.id, "keep").unwrap();
        let drop_me = store.add_subtask(&task.id, "drop").unwrap();

        store.update_text(&task.id, "final\ndraft").unwrap();
        store.update_priority(&task.id, Priority::Critical).unwrap();
        store.update_priority(&keep.id, Priority::Low).unwrap();
        store.remove_task(&drop_me.id).unwrap();

        let reopened = sqlite_store(dir.path(), &clock);
        let saved = reopened.task(&task.id).unwrap();
        assert_eq!(saved.text, "final draft");
        assert_eq!(saved.priority, Priority::Critical);
        assert_eq!(saved.subtasks.len(), 1);
        assert_eq!(saved.subtasks[0].priority, Priority::Low);

        reopened.remove_task(&task.id).unwrap();
        assert!(reopened.tasks().is_empty());
        assert!(matches!(
            reopened.remove_task(&task.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn clear_all_empties_forest_and_storage() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = file_store(dir.path(), &clock, WriteMode::Immediate);
        store.add_task("a", Priority::Normal).unwrap();
        store.add_task("b", Priority::Normal).unwrap();
        store.clear_all().unwrap();
        let reopened = file_store(dir.path(), &clock, WriteMode::Immediate);
        assert!(reopened.tasks().is_empty());
    }

    #[test]
    fn migrate_persists_once_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(14, 10)));
        let store = sqlite_store(dir.path(), &clock);
        let original = store.add_task("carry over", Priority::High).unwrap();

        clock.set(at(15, 9));
        let report = store.migrate().unwrap();
        assert_eq!(report.count(), 1);

        let reopened = sqlite_store(dir.path(), &clock);
        let tasks = reopened.tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, original.id);
        assert_eq!(tasks[0].status, TaskStatus::Migrated);
        assert_eq!(tasks[1].text, "carry over");
        assert_eq!(tasks[1].status, TaskStatus::Todo);
        assert_eq!(tasks[1].priority, Priority::Normal);
        assert_eq!(tasks[1].created_at.date(), at(15, 0).date());

        clock.set(at(15, 18));
        assert!(reopened.migrate().unwrap().is_empty());
        assert_eq!(reopened.tasks(), tasks);
    }

    #[test]
    fn purge_removes_old_completed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(1, 9)));
        let store = sqlite_store(dir.path(), &clock);
        let old = store.add_task("old", Priority::Normal).unwrap();
        let open = store.add_task("open", Priority::Normal).unwrap();
        let old_sub = store.add_subtask(&open.id, "old sub").unwrap();
        store.toggle_done(&old.id).unwrap();
        store.toggle_done(&old_sub.id).unwrap();

        clock.set(at(10, 9));
        let recent = store.add_task("recent", Priority::Normal).unwrap();
        store.toggle_done(&recent.id).unwrap();

        assert_eq!(store.purge_completed(7).unwrap(), 2);
        let ids: Vec<_> = store.tasks().into_iter().map(|task| task.id).collect();
        assert_eq!(ids, vec![open.id.clone(), recent.id]);
        assert!(store.task(&open.id).unwrap().subtasks.is_empty());
        assert_eq!(store.purge_completed(7).unwrap(), 0);
    }

    #[test]
    fn purge_with_out_of_range_window_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(1, 9)));
        let store = sqlite_store(dir.path(), &clock);
        let done = store.add_task("done", Priority::Normal).unwrap();
        store.toggle_done(&done.id).unwrap();
        clock.set(at(20, 9));

        assert_eq!(store.purge_completed(u32::MAX).unwrap(), 0);
        assert_eq!(store.purge_completed(100_000_000).unwrap(), 0);
        assert_eq!(store.tasks().len(), 1);
    }

    #[test]
    fn save_repairs_completion_and_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        let mut done = task_with_id("dup00001", "done", at(15, 8));
        done.status = TaskStatus::Done;
        let mut todo = task_with_id("dup00001", "todo", at(15, 8));
        todo.completed_at = Some(at(15, 8));
        store.save(vec![done, todo]).unwrap();

        let tasks = store.tasks();
        assert_eq!(tasks[0].id, "dup00001");
        assert_ne!(tasks[1].id, "dup00001");
        assert_eq!(tasks[0].completed_at, Some(at(15, 8)));
        assert_eq!(tasks[1].completed_at, None);
        for task in &tasks {
            assert_eq!(task.completed_at.is_some(), task.status == TaskStatus::Done);
        }
    }

    #[test]
    fn import_appends_with_fresh_ids_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        store
            .save(vec![task_with_id("aaaa0001", "existing", at(15, 8))])
            .unwrap();
        let imported = store
            .import_tasks(vec![
                task_with_id("aaaa0001", "clash", at(14, 8)),
                task_with_id("bbbb0001", "new", at(14, 9)),
            ])
            .unwrap();
        assert_eq!(imported, 2);
        let tasks = store.tasks();
        assert_eq!(tasks.len(), 3);
        assert_ne!(tasks[1].id, "aaaa0001");
        assert_eq!(tasks[2].id, "bbbb0001");
    }

    #[test]
    fn theme_defaults_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        assert_eq!(store.theme(), "theme-dark");
        store.set_theme("theme-light").unwrap();
        assert_eq!(store.theme(), "theme-light");
        assert_eq!(sqlite_store(dir.path(), &clock).theme(), "theme-light");
    }

    #[test]
    fn listeners_see_each_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(Arc::new(move |event: &StoreEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        let task = store.add_task("a", Priority::Normal).unwrap();
        store.toggle_done(&task.id).unwrap();
        store.clear_all().unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                StoreEvent::TaskAdded {
                    id: task.id.clone()
                },
                StoreEvent::TaskUpdated { id: task.id },
                StoreEvent::Cleared,
            ]
        );
    }

    #[test]
    fn snapshot_reflects_forest() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = sqlite_store(dir.path(), &clock);
        let task = store.add_task("report me", Priority::Normal).unwrap();
        store.add_subtask(&task.id, "child").unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, "report me");
        assert_eq!(snapshot[0].created_at, at(15, 9));
        assert_eq!(snapshot[0].subtasks[0].text, "child");
    }

    #[test]
    fn queued_writes_land_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = file_store(dir.path(), &clock, WriteMode::Queued);
        let task = store.add_task("quick", Priority::Normal).unwrap();
        store.toggle_done(&task.id).unwrap();
        store.remove_task(&task.id).unwrap();
        let kept = store.add_task("kept", Priority::Low).unwrap();
        store.flush().unwrap();

        let reopened = file_store(dir.path(), &clock, WriteMode::Immediate);
        assert_eq!(reopened.tasks(), vec![kept]);
    }

    #[test]
    fn failed_save_keeps_memory_and_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(15, 9)));
        let store = file_store(dir.path(), &clock, WriteMode::Immediate);
        let first = store.add_task("persisted", Priority::Normal).unwrap();

        // A directory where the temp file would go makes the next write fail.
        std::fs::create_dir(dir.path().join(".daily_plan.tmp")).unwrap();
        let err = store.add_task("unsaved", Priority::Normal).unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        assert_eq!(store.tasks().len(), 2);

        let reopened = file_store(dir.path(), &clock, WriteMode::Immediate);
        assert_eq!(reopened.tasks(), vec![first]);
    }
}
