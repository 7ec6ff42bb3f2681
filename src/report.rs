//! Read-only snapshot for the report view and the aggregates it shows.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{Subtask, Task, TaskStatus, Timestamp};

pub const RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtaskView {
    pub created_at: Timestamp,
    pub status: TaskStatus,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    pub created_at: Timestamp,
    pub status: TaskStatus,
    pub text: String,
    pub subtasks: Vec<SubtaskView>,
}

impl From<&Subtask> for SubtaskView {
    fn from(sub: &Subtask) -> Self {
        Self {
            created_at: sub.created_at,
            status: sub.status,
            text: sub.text.clone(),
        }
    }
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            created_at: task.created_at,
            status: task.status,
            text: task.text.clone(),
            subtasks: task.subtasks.iter().map(SubtaskView::from).collect(),
        }
    }
}

pub fn snapshot(tasks: &[Task]) -> Vec<TaskView> {
    tasks.iter().map(TaskView::from).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSummary {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub total: usize,
    pub completed: usize,
    pub efficiency_percent: f64,
    /// One entry per date in `start..=end`, including empty days.
    pub daily_counts: Vec<(NaiveDate, usize)>,
    /// Newest first.
    pub recent: Vec<TaskView>,
}

/// Aggregates the top-level tasks created within `start..=end`. `None` for an inverted range.
pub fn summarize(views: &[TaskView], start: NaiveDate, end: NaiveDate) -> Option<RangeSummary> {
    if start > end {
        return None;
    }
    let in_range: Vec<&TaskView> = views
        .iter()
        .filter(|view| {
            let date = view.created_at.date();
            date >= start && date <= end
        })
        .collect();

    let total = in_range.len();
    let completed = in_range
        .iter()
        .filter(|view| view.status == TaskStatus::Done)
        .count();
    let efficiency_percent = if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    };

    let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for view in &in_range {
        *per_day.entry(view.created_at.date()).or_default() += 1;
    }
    let daily_counts = start
        .iter_days()
        .take_while(|date| *date <= end)
        .map(|date| (date, per_day.get(&date).copied().unwrap_or(0)))
        .collect();

    let mut recent: Vec<TaskView> = in_range.into_iter().cloned().collect();
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    recent.truncate(RECENT_LIMIT);

    Some(RangeSummary {
        start,
        end,
        total,
        completed,
        efficiency_percent,
        daily_counts,
        recent,
    })
}

/// Bar glyph for one day of the activity histogram.
pub fn histogram_glyph(count: usize) -> char {
    match count {
        0 => ' ',
        1..=2 => '▂',
        3..=4 => '▄',
        5..=6 => '▆',
        _ => '█',
    }
}

/// Plain-text rendering: totals, one histogram row per day, then the recent entries.
pub fn render_summary(summary: &RangeSummary) -> String {
    let mut out = format!(
        "{} .. {}\ntotal {}  completed {}  efficiency {:.0}%\n",
        summary.start, summary.end, summary.total, summary.completed, summary.efficiency_percent
    );
    for (date, count) in &summary.daily_counts {
        out.push_str(&format!(
            "{} {} {count}\n",
            date.format("%m-%d"),
            histogram_glyph(*count)
        ));
    }
    if !summary.recent.is_empty() {
        out.push_str("recent:\n");
        for view in &summary.recent {
            let mark = match view.status {
                TaskStatus::Done => 'x',
                TaskStatus::Migrated => '>',
                TaskStatus::Todo => ' ',
            };
            out.push_str(&format!(
                "  [{mark}] {} {}\n",
                view.created_at.format("%Y-%m-%d %H:%M"),
                view.text
            ));
        }
    }
    out
}
