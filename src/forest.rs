//! Flat record view of the task forest.
//!
//! Both storage generations persist one record per task. Records are linked to their owner
//! either positionally (flat file: a subtask belongs to the closest preceding top-level record)
//! or by explicit parent id (relational rows). [`assemble`] rebuilds the two-level forest from
//! either kind of link and [`flatten`] produces the records for a save.

use std::collections::{HashMap, HashSet};

use crate::models::{generate_unique_id, Priority, Subtask, Task, TaskStatus, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    None,
    Previous,
    Id(String),
}

impl ParentRef {
    pub fn is_subtask(&self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatRecord {
    /// Legacy flat-file lines carry no id; one is assigned during [`assemble`].
    pub id: Option<String>,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub priority: Priority,
    pub parent: ParentRef,
}

impl FlatRecord {
    fn from_task(task: &Task) -> Self {
        Self {
            id: Some(task.id.clone()),
            text: task.text.clone(),
            status: task.status,
            created_at: task.created_at,
            completed_at: task.completed_at,
            priority: task.priority,
            parent: ParentRef::None,
        }
    }

    fn from_subtask(sub: &Subtask, parent_id: &str) -> Self {
        Self {
            id: Some(sub.id.clone()),
            text: sub.text.clone(),
            status: sub.status,
            created_at: sub.created_at,
            completed_at: sub.completed_at,
            priority: sub.priority,
            parent: ParentRef::Id(parent_id.to_string()),
        }
    }

    fn into_task(self, id: String) -> Task {
        Task {
            id,
            text: self.text,
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            priority: self.priority,
            subtasks: Vec::new(),
        }
    }

    fn into_subtask(self, id: String) -> Subtask {
        Subtask {
            id,
            text: self.text,
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            priority: self.priority,
        }
    }
}

/// Records for a full save: every top-level task followed by its subtasks, in forest order.
pub fn flatten(tasks: &[Task]) -> Vec<FlatRecord> {
    let mut records = Vec::with_capacity(tasks.len());
    for task in tasks {
        records.push(FlatRecord::from_task(task));
        for sub in &task.subtasks {
            records.push(FlatRecord::from_subtask(sub, &task.id));
        }
    }
    records
}

/// Rebuilds the forest from decoded records.
///
/// Subtasks whose owner can not be found, or whose owner is itself a subtask, are promoted to
/// top level. Top-level tasks come back ordered by `created_at`; ties keep record order.
pub fn assemble(records: Vec<FlatRecord>) -> Vec<Task> {
    let declared: HashSet<String> = records.iter().filter_map(|r| r.id.clone()).collect();
    let mut assigned: HashSet<String> = HashSet::with_capacity(records.len());

    let mut tops: Vec<Task> = Vec::new();
    let mut top_index: HashMap<String, usize> = HashMap::new();
    let mut last_top: Option<usize> = None;
    let mut linked: Vec<(String, FlatRecord, String)> = Vec::new();
    let mut orphans: Vec<(FlatRecord, String)> = Vec::new();

    for mut record in records {
        let id = match record.id.take() {
            Some(id) if !assigned.contains(&id) => id,
            previous => {
                if let Some(dup) = previous {
                    log::warn!("duplicate task id {dup} in storage; assigning a fresh id");
                }
                generate_unique_id(|candidate| {
                    declared.contains(candidate) || assigned.contains(candidate)
                })
            }
        };
        assigned.insert(id.clone());

        match record.parent.clone() {
            ParentRef::None => {
                top_index.insert(id.clone(), tops.len());
                last_top = Some(tops.len());
                tops.push(record.into_task(id));
            }
            ParentRef::Previous => match last_top {
                Some(index) => tops[index].subtasks.push(record.into_subtask(id)),
                None => orphans.push((record, id)),
            },
            ParentRef::Id(parent_id) => linked.push((parent_id, record, id)),
        }
    }

    for (parent_id, record, id) in linked {
        match top_index.get(&parent_id) {
            Some(&index) => tops[index].subtasks.push(record.into_subtask(id)),
            None => orphans.push((record, id)),
        }
    }

    for (record, id) in orphans {
        log::info!("promoting orphaned subtask {id} to top level");
        tops.push(record.into_task(id));
    }

    tops.sort_by_key(|task| task.created_at);
    tops
}
