use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};

use crate::events::StatePayload;
use crate::migration::MigrationReport;
use crate::models::{Priority, Subtask, Task, TaskStatus, Timestamp};
use crate::report::{render_summary, summarize, RangeSummary};
use crate::settings::{normalize_theme, THEMES};
use crate::state::{StoreError, TaskStore};
use crate::storage::{load_flat_content, read_optional, write_atomic, StorageError};

pub const HELP: &str = "\
<text> [low|high|critical]   add a task
<text> [sub:<id>]            add a subtask
!s <id> <text>               add a subtask
!done <id>                   toggle done
!edit <id> <text>            change text
!prio <id> <level>           change priority
!rm <id>                     remove a task or subtask
!list                        show all tasks
!theme [name]                switch theme
!report [start end]          summary, dates as YYYY-MM-DD
!purge <days>                drop tasks completed more than <days> ago
!export <path>               write tasks as JSON
!import <path>               append tasks from a task file
clear | migrate | help | exit";

pub const ORPHAN_SUFFIX: &str = " (Orphaned subtask)";

const REPORT_DEFAULT_DAYS: i64 = 7;
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, serde::Serialize)]
pub struct CommandResult<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

pub trait CommandCtx {
    fn store(&self) -> &TaskStore;
    fn emit_state_updated(&self, payload: StatePayload);
}

fn ok<T>(data: T) -> CommandResult<T> {
    CommandResult {
        ok: true,
        data: Some(data),
        error: None,
    }
}

fn err<T>(message: &str) -> CommandResult<T> {
    CommandResult {
        ok: false,
        data: None,
        error: Some(message.to_string()),
    }
}

fn publish(ctx: &impl CommandCtx) {
    ctx.emit_state_updated(ctx.store().state_payload());
}

fn store_err<T>(error: StoreError) -> CommandResult<T> {
    match &error {
        StoreError::Storage(_) => log::error!("command failed: {error}"),
        _ => log::debug!("command rejected: {error}"),
    }
    err(&error.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { text: String, priority: Priority },
    AddSubtask { parent_prefix: String, text: String },
    Toggle { id: String },
    Edit { id: String, text: String },
    SetPriority { id: String, priority: Priority },
    Remove { id: String },
    List,
    Clear,
    Migrate,
    Theme { name: Option<String> },
    Report { range: Option<(NaiveDate, NaiveDate)> },
    Purge { days: u32 },
    Export { path: PathBuf },
    Import { path: PathBuf },
    Help,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("nothing to do")]
    Empty,
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown priority '{0}' (low, normal, high, critical)")]
    UnknownPriority(String),
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unknown command '{0}', try help")]
    UnknownCommand(String),
}

/// Parses one input line. Anything that is not a command is a new task.
pub fn parse_input(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    match line.to_ascii_lowercase().as_str() {
        "clear" | "!clear" => return Ok(Command::Clear),
        "help" | "!help" => return Ok(Command::Help),
        "migrate" | "!migrate" => return Ok(Command::Migrate),
        "exit" | "!exit" | "quit" => return Ok(Command::Exit),
        _ => {}
    }
    if line.starts_with('!') {
        return parse_bang(line);
    }
    Ok(parse_tagged(line))
}

fn parse_bang(line: &str) -> Result<Command, ParseError> {
    let (name, rest) = split_word(line);
    let rest = rest.unwrap_or("");
    match name.to_ascii_lowercase().as_str() {
        "!s" | "!sub" => {
            let (parent_prefix, text) = id_and_text(rest, "!s <id> <text>")?;
            Ok(Command::AddSubtask {
                parent_prefix,
                text,
            })
        }
        "!done" | "!toggle" => Ok(Command::Toggle {
            id: single_arg(rest, "!done <id>")?,
        }),
        "!edit" => {
            let (id, text) = id_and_text(rest, "!edit <id> <text>")?;
            Ok(Command::Edit { id, text })
        }
        "!prio" => {
            let (id, level) = id_and_text(rest, "!prio <id> <level>")?;
            let priority =
                Priority::from_name(&level).ok_or(ParseError::UnknownPriority(level))?;
            Ok(Command::SetPriority { id, priority })
        }
        "!rm" | "!del" => Ok(Command::Remove {
            id: single_arg(rest, "!rm <id>")?,
        }),
        "!list" | "!ls" => Ok(Command::List),
        "!theme" => Ok(Command::Theme {
            name: (!rest.trim().is_empty()).then(|| rest.trim().to_string()),
        }),
        "!report" => parse_report(rest),
        "!purge" => {
            let value = single_arg(rest, "!purge <days>")?;
            let days = value
                .parse::<u32>()
                .map_err(|_| ParseError::InvalidNumber(value))?;
            Ok(Command::Purge { days })
        }
        "!export" => Ok(Command::Export {
            path: PathBuf::from(single_arg(rest, "!export <path>")?),
        }),
        "!import" => Ok(Command::Import {
            path: PathBuf::from(single_arg(rest, "!import <path>")?),
        }),
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn parse_report(rest: &str) -> Result<Command, ParseError> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    match parts.as_slice() {
        [] => Ok(Command::Report { range: None }),
        [start, end] => Ok(Command::Report {
            range: Some((parse_date(start)?, parse_date(end)?)),
        }),
        _ => Err(ParseError::Usage("!report [start end]")),
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, ParseError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| ParseError::InvalidDate(value.to_string()))
}

/// `text [tag]` where the tag is a priority name or `sub:<id>`. Unknown tags stay part of
/// the text.
fn parse_tagged(line: &str) -> Command {
    let plain = || Command::Add {
        text: line.to_string(),
        priority: Priority::Normal,
    };
    let Some(open) = line.strip_suffix(']').and_then(|body| body.rfind('[')) else {
        return plain();
    };
    let tag = &line[open + 1..line.len() - 1];
    let head = &line[..open];
    let valid_tag = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':');
    let text = head.trim_end();
    if !valid_tag || text.len() == head.len() || text.trim().is_empty() {
        return plain();
    }
    let text = text.trim().to_string();

    let lower = tag.to_ascii_lowercase();
    if let Some(prefix) = lower.strip_prefix("sub:") {
        if prefix.is_empty() {
            return plain();
        }
        return Command::AddSubtask {
            parent_prefix: prefix.to_string(),
            text,
        };
    }
    match lower.as_str() {
        "low" => Command::Add {
            text,
            priority: Priority::Low,
        },
        "high" => Command::Add {
            text,
            priority: Priority::High,
        },
        "critical" => Command::Add {
            text,
            priority: Priority::Critical,
        },
        _ => plain(),
    }
}

fn split_word(input: &str) -> (&str, Option<&str>) {
    let input = input.trim();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, Some(rest.trim())),
        None => (input, None),
    }
}

fn single_arg(rest: &str, usage: &'static str) -> Result<String, ParseError> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(ParseError::Usage(usage));
    }
    Ok(rest.to_string())
}

fn id_and_text(rest: &str, usage: &'static str) -> Result<(String, String), ParseError> {
    match split_word(rest) {
        (id, Some(text)) if !id.is_empty() && !text.is_empty() => {
            Ok((id.to_string(), text.to_string()))
        }
        _ => Err(ParseError::Usage(usage)),
    }
}

/// What a command produced, ready for display or serialization.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    TaskAdded { task: Task },
    SubtaskAdded { parent_id: String, subtask: Subtask },
    OrphanAdded { task: Task },
    Toggled { id: String, status: TaskStatus },
    Updated { id: String },
    Removed { id: String },
    Listing { tasks: Vec<Task> },
    Cleared,
    Migrated { report: MigrationReport },
    Theme { theme: String },
    Report { summary: RangeSummary },
    Purged { count: usize },
    Exported { path: String, count: usize },
    Imported { count: usize, skipped: usize },
    Help,
    Exit,
}

impl Reply {
    pub fn render(&self) -> String {
        match self {
            Self::TaskAdded { task } => format!("added {} {}", task.id, task.text),
            Self::SubtaskAdded { parent_id, subtask } => {
                format!("added {} under {parent_id}", subtask.id)
            }
            Self::OrphanAdded { task } => {
                format!("no parent found, added {} {}", task.id, task.text)
            }
            Self::Toggled { id, status } => format!("{id} is now {}", status_label(*status)),
            Self::Updated { id } => format!("updated {id}"),
            Self::Removed { id } => format!("removed {id}"),
            Self::Listing { tasks } => render_forest(tasks),
            Self::Cleared => "cleared all tasks".to_string(),
            Self::Migrated { report } if report.is_empty() => "nothing to migrate".to_string(),
            Self::Migrated { report } => format!("migrated {} tasks", report.count()),
            Self::Theme { theme } => format!("theme {theme}"),
            Self::Report { summary } => render_summary(summary),
            Self::Purged { count } => format!("purged {count} completed tasks"),
            Self::Exported { path, count } => format!("exported {count} tasks to {path}"),
            Self::Imported { count, skipped } if *skipped > 0 => {
                format!("imported {count} tasks ({skipped} unreadable lines skipped)")
            }
            Self::Imported { count, .. } => format!("imported {count} tasks"),
            Self::Help => HELP.to_string(),
            Self::Exit => String::new(),
        }
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "todo",
        TaskStatus::Done => "done",
        TaskStatus::Migrated => "migrated",
    }
}

fn status_mark(status: TaskStatus) -> char {
    match status {
        TaskStatus::Todo => ' ',
        TaskStatus::Done => 'x',
        TaskStatus::Migrated => '>',
    }
}

pub fn render_forest(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "no tasks".to_string();
    }
    let mut out = String::new();
    for task in tasks {
        out.push_str(&format!(
            "[{}] {} {} {:<8} {}\n",
            status_mark(task.status),
            task.id,
            task.created_at.format("%m-%d %H:%M"),
            task.priority.as_str(),
            task.text
        ));
        for sub in &task.subtasks {
            out.push_str(&format!(
                "    [{}] {} {}\n",
                status_mark(sub.status),
                sub.id,
                sub.text
            ));
        }
    }
    out.trim_end().to_string()
}

/// Footer counter of unfinished top-level tasks.
pub fn status_line(pending: usize) -> String {
    let noun = if pending == 1 { "process" } else { "processes" };
    format!("{pending} {noun} active")
}

/// Parses and runs one input line.
pub fn execute_line(ctx: &impl CommandCtx, line: &str) -> CommandResult<Reply> {
    match parse_input(line) {
        Ok(command) => execute(ctx, command),
        Err(error) => err(&error.to_string()),
    }
}

pub fn execute(ctx: &impl CommandCtx, command: Command) -> CommandResult<Reply> {
    match command {
        Command::Add { text, priority } => add_task_impl(ctx, &text, priority),
        Command::AddSubtask {
            parent_prefix,
            text,
        } => add_subtask_impl(ctx, &parent_prefix, &text),
        Command::Toggle { id } => toggle_done_impl(ctx, &id),
        Command::Edit { id, text } => update_text_impl(ctx, &id, &text),
        Command::SetPriority { id, priority } => update_priority_impl(ctx, &id, priority),
        Command::Remove { id } => remove_task_impl(ctx, &id),
        Command::List => ok(Reply::Listing {
            tasks: ctx.store().tasks(),
        }),
        Command::Clear => clear_all_impl(ctx),
        Command::Migrate => migrate_impl(ctx),
        Command::Theme { name } => set_theme_impl(ctx, name.as_deref()),
        Command::Report { range } => report_impl(ctx, range),
        Command::Purge { days } => purge_impl(ctx, days),
        Command::Export { path } => export_tasks_json_impl(ctx, &path),
        Command::Import { path } => import_tasks_impl(ctx, &path),
        Command::Help => ok(Reply::Help),
        Command::Exit => ok(Reply::Exit),
    }
}

fn add_task_impl(ctx: &impl CommandCtx, text: &str, priority: Priority) -> CommandResult<Reply> {
    match ctx.store().add_task(text, priority) {
        Ok(task) => {
            publish(ctx);
            ok(Reply::TaskAdded { task })
        }
        Err(error) => store_err(error),
    }
}

/// Adds a subtask, or a marked top-level task when no parent matches the prefix.
fn add_subtask_impl(
    ctx: &impl CommandCtx,
    parent_prefix: &str,
    text: &str,
) -> CommandResult<Reply> {
    let store = ctx.store();
    let reply = match store.add_subtask(parent_prefix, text) {
        Ok(subtask) => {
            let parent_id = store
                .task(&subtask.id)
                .map(|parent| parent.id)
                .unwrap_or_default();
            Reply::SubtaskAdded { parent_id, subtask }
        }
        Err(StoreError::NotFound(_)) => {
            log::info!("no parent matches '{parent_prefix}', adding as orphaned task");
            match store.add_task(&format!("{text}{ORPHAN_SUFFIX}"), Priority::Normal) {
                Ok(task) => Reply::OrphanAdded { task },
                Err(error) => return store_err(error),
            }
        }
        Err(error) => return store_err(error),
    };
    publish(ctx);
    ok(reply)
}

fn toggle_done_impl(ctx: &impl CommandCtx, id: &str) -> CommandResult<Reply> {
    let id = resolved_id(ctx.store(), id);
    match ctx.store().toggle_done(&id) {
        Ok(status) => {
            publish(ctx);
            ok(Reply::Toggled { id, status })
        }
        Err(error) => store_err(error),
    }
}

fn update_text_impl(ctx: &impl CommandCtx, id: &str, text: &str) -> CommandResult<Reply> {
    let id = resolved_id(ctx.store(), id);
    match ctx.store().update_text(&id, text) {
        Ok(()) => {
            publish(ctx);
            ok(Reply::Updated { id })
        }
        Err(error) => store_err(error),
    }
}

fn update_priority_impl(
    ctx: &impl CommandCtx,
    id: &str,
    priority: Priority,
) -> CommandResult<Reply> {
    let id = resolved_id(ctx.store(), id);
    match ctx.store().update_priority(&id, priority) {
        Ok(()) => {
            publish(ctx);
            ok(Reply::Updated { id })
        }
        Err(error) => store_err(error),
    }
}

fn remove_task_impl(ctx: &impl CommandCtx, id: &str) -> CommandResult<Reply> {
    let id = resolved_id(ctx.store(), id);
    match ctx.store().remove_task(&id) {
        Ok(()) => {
            publish(ctx);
            ok(Reply::Removed { id })
        }
        Err(error) => store_err(error),
    }
}

fn clear_all_impl(ctx: &impl CommandCtx) -> CommandResult<Reply> {
    match ctx.store().clear_all() {
        Ok(()) => {
            publish(ctx);
            ok(Reply::Cleared)
        }
        Err(error) => store_err(error),
    }
}

fn migrate_impl(ctx: &impl CommandCtx) -> CommandResult<Reply> {
    match ctx.store().migrate() {
        Ok(report) => {
            if !report.is_empty() {
                publish(ctx);
            }
            ok(Reply::Migrated { report })
        }
        Err(error) => store_err(error),
    }
}

/// Switches to the named theme, or to the next one in the list when no name is given.
fn set_theme_impl(ctx: &impl CommandCtx, name: Option<&str>) -> CommandResult<Reply> {
    let store = ctx.store();
    let theme = match name {
        Some(name) => match normalize_theme(name) {
            Some(theme) => theme,
            None => {
                return err(&format!(
                    "unknown theme '{name}' ({})",
                    THEMES.join(", ")
                ))
            }
        },
        None => next_theme(&store.theme()).to_string(),
    };
    if let Err(error) = store.set_theme(&theme) {
        return store_err(error);
    }
    publish(ctx);
    ok(Reply::Theme { theme })
}

fn next_theme(current: &str) -> &'static str {
    let index = THEMES.iter().position(|theme| *theme == current);
    match index {
        Some(index) => THEMES[(index + 1) % THEMES.len()],
        None => THEMES[0],
    }
}

fn report_impl(
    ctx: &impl CommandCtx,
    range: Option<(NaiveDate, NaiveDate)>,
) -> CommandResult<Reply> {
    let store = ctx.store();
    let (start, end) = range.unwrap_or_else(|| {
        let today = store.today();
        (today - Duration::days(REPORT_DEFAULT_DAYS - 1), today)
    });
    match summarize(&store.snapshot(), start, end) {
        Some(summary) => ok(Reply::Report { summary }),
        None => err("report start must not be after its end"),
    }
}

fn purge_impl(ctx: &impl CommandCtx, days: u32) -> CommandResult<Reply> {
    match ctx.store().purge_completed(days) {
        Ok(count) => {
            if count > 0 {
                publish(ctx);
            }
            ok(Reply::Purged { count })
        }
        Err(error) => store_err(error),
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ExportFile {
    pub exported_at: Timestamp,
    pub tasks: Vec<Task>,
}

fn export_tasks_json_impl(ctx: &impl CommandCtx, path: &Path) -> CommandResult<Reply> {
    let store = ctx.store();
    let data = ExportFile {
        exported_at: store.now(),
        tasks: store.tasks(),
    };
    if let Err(error) = write_export(path, &data) {
        log::warn!("export to {} failed: {error}", path.display());
        return err(&format!("export error: {error}"));
    }
    ok(Reply::Exported {
        path: path.to_string_lossy().to_string(),
        count: data.tasks.len(),
    })
}

fn write_export(path: &Path, data: &ExportFile) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(data)?;
    write_atomic(path, &json)
}

/// Appends tasks from a JSON export or a task file of any line generation.
fn import_tasks_impl(ctx: &impl CommandCtx, path: &Path) -> CommandResult<Reply> {
    let store = ctx.store();
    let content = match read_optional(path) {
        Ok(Some(content)) => content,
        Ok(None) => return err(&format!("file not found: {}", path.display())),
        Err(error) => return err(&format!("import error: {error}")),
    };
    let (tasks, skipped) = if content.trim_start().starts_with('{') {
        match serde_json::from_str::<ExportFile>(&content).map_err(StorageError::from) {
            Ok(file) => (file.tasks, 0),
            Err(error) => return err(&format!("import error: {error}")),
        }
    } else {
        let loaded = load_flat_content(&content, store.now());
        (loaded.tasks, loaded.skipped.len())
    };
    match store.import_tasks(tasks) {
        Ok(count) => {
            log::info!("imported {count} tasks from {}", path.display());
            if count > 0 {
                publish(ctx);
            }
            ok(Reply::Imported { count, skipped })
        }
        Err(error) => store_err(error),
    }
}

fn resolved_id(store: &TaskStore, id: &str) -> String {
    store
        .resolve_id(id)
        .unwrap_or_else(|| id.trim().to_string())
}
