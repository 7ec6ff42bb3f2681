//! Daily rollover of unfinished work.
//!
//! Top-level tasks created yesterday that are still `Todo` become `Migrated` history entries,
//! and a fresh `Todo` copy is added for today. Already-migrated originals and today's copies never
//! qualify again, so running the rollover twice in a day changes nothing the second time.

use chrono::NaiveDate;

use crate::models::{contains_id, generate_unique_id, Priority, Task, TaskStatus, Timestamp};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MigrationReport {
    /// Ids of the originals that are now `Migrated`.
    pub sources: Vec<String>,
    /// Ids of the new copies, in the same order as `sources`.
    pub created: Vec<String>,
}

impl MigrationReport {
    pub fn count(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Indexes of the tasks that roll forward into `today`. Only the date part of `created_at`
/// is compared.
pub fn select_candidates(tasks: &[Task], today: NaiveDate) -> Vec<usize> {
    let Some(yesterday) = today.pred_opt() else {
        return Vec::new();
    };
    tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| task.status == TaskStatus::Todo && task.created_at.date() == yesterday)
        .map(|(index, _)| index)
        .collect()
}

/// Applies the rollover in memory. The caller persists the whole batch once.
pub fn apply(tasks: &mut Vec<Task>, now: Timestamp) -> MigrationReport {
    let mut report = MigrationReport::default();
    for index in select_candidates(tasks, now.date()) {
        tasks[index].mark_migrated();
        let text = tasks[index].text.clone();
        report.sources.push(tasks[index].id.clone());

        let id = generate_unique_id(|candidate| contains_id(tasks.as_slice(), candidate));
        tasks.push(Task::new(id.clone(), &text, Priority::Normal, now));
        report.created.push(id);
    }
    report
}
