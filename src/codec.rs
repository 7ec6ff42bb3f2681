//! Line codec for the flat-file task store.
//!
//! One record per line, `|`-separated. Shapes seen in the wild, newest first:
//!
//! ```text
//! [SUB|]id=<id>|<status>|<created>|<completed>|<priority>|<text>
//! [SUB|]<status>|<created>|<completed>|<priority>|<text>
//! [SUB|]<status>|<created>|<completed>|<text>
//! ```
//!
//! There is no version tag. The shape is read from the `SUB|` and `id=` markers and from the
//! field count; the text is always the last field and may itself contain `|`.

use chrono::NaiveDateTime;

use crate::forest::{FlatRecord, ParentRef};
use crate::models::{repair_completion, Priority, TaskStatus, Timestamp};

pub const DELIMITER: char = '|';
pub const SUBTASK_MARKER: &str = "SUB|";
pub const ID_MARKER: &str = "id=";
pub const NULL_SENTINEL: &str = "null";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const TIMESTAMP_FORMAT_SPACED: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected 4 or 5 fields, found {0}")]
    Arity(usize),
    #[error("empty id marker")]
    EmptyId,
    #[error("unknown status code {0}")]
    UnknownStatus(i64),
    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
    #[error("unreadable column: {0}")]
    Column(String),
}

/// A record that failed to decode. The rest of the load carries on without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeSkip {
    /// 1-based line number, or the row id for relational storage.
    pub location: String,
    pub error: DecodeError,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodedLines {
    pub records: Vec<FlatRecord>,
    pub skipped: Vec<DecodeSkip>,
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<Timestamp, DecodeError> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT_SPACED))
        .map_err(|_| DecodeError::Timestamp(value.to_string()))
}

/// Status field: integer code, or legacy boolean-style data when it is not a number.
pub fn decode_status(field: &str) -> Result<TaskStatus, DecodeError> {
    let field = field.trim();
    match field.parse::<i64>() {
        Ok(code) => TaskStatus::from_code(code).ok_or(DecodeError::UnknownStatus(code)),
        Err(_) if field == "1" => Ok(TaskStatus::Done),
        Err(_) => Ok(TaskStatus::Todo),
    }
}

/// Priority field: unknown names fall back to `Normal`.
pub fn decode_priority(field: &str) -> Priority {
    Priority::from_name(field).unwrap_or_default()
}

/// Decodes one non-blank line. `now` stands in for a missing creation time.
pub fn decode_line(line: &str, now: Timestamp) -> Result<FlatRecord, DecodeError> {
    let (rest, parent) = match line.strip_prefix(SUBTASK_MARKER) {
        Some(rest) => (rest, ParentRef::Previous),
        None => (line, ParentRef::None),
    };

    let (rest, id) = match rest.strip_prefix(ID_MARKER) {
        Some(tail) => {
            let (id, tail) = tail.split_once(DELIMITER).unwrap_or((tail, ""));
            if id.trim().is_empty() {
                return Err(DecodeError::EmptyId);
            }
            (tail, Some(id.trim().to_string()))
        }
        None => (rest, None),
    };

    let fields: Vec<&str> = rest.splitn(5, DELIMITER).collect();
    let (status, created, completed, priority, text) = match fields.as_slice() {
        // Id-less lines may be 4-field records whose text holds a delimiter.
        [status, created, completed, head, tail]
            if id.is_none() && Priority::from_name(head).is_none() =>
        {
            let text = format!("{head}{DELIMITER}{tail}");
            (*status, *created, *completed, Priority::Normal, text)
        }
        [status, created, completed, priority, text] => {
            let priority = decode_priority(priority);
            (*status, *created, *completed, priority, text.to_string())
        }
        [status, created, completed, text] => {
            (*status, *created, *completed, Priority::Normal, text.to_string())
        }
        other => return Err(DecodeError::Arity(other.len())),
    };

    let status = decode_status(status)?;
    let created_at = match created.trim() {
        NULL_SENTINEL => now,
        value => parse_timestamp(value)?,
    };
    let completed_at = match completed.trim() {
        NULL_SENTINEL => None,
        value => Some(parse_timestamp(value)?),
    };

    Ok(FlatRecord {
        id,
        text,
        status,
        created_at,
        completed_at: repair_completion(status, created_at, completed_at),
        priority,
        parent,
    })
}

/// Decodes a whole file. Blank lines are ignored; malformed lines are reported and skipped.
pub fn decode_lines(content: &str, now: Timestamp) -> DecodedLines {
    let mut decoded = DecodedLines::default();
    for (index, line) in content.lines().enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(line, now) {
            Ok(record) => decoded.records.push(record),
            Err(error) => {
                let location = format!("line {}", index + 1);
                log::warn!("skipping malformed task record at {location}: {error}");
                decoded.skipped.push(DecodeSkip { location, error });
            }
        }
    }
    decoded
}

pub fn encode_record(record: &FlatRecord) -> String {
    let mut out = String::new();
    if record.parent.is_subtask() {
        out.push_str(SUBTASK_MARKER);
    }
    if let Some(id) = &record.id {
        out.push_str(ID_MARKER);
        out.push_str(id);
        out.push(DELIMITER);
    }
    let completed = record
        .completed_at
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_else(|| NULL_SENTINEL.to_string());
    out.push_str(&format!(
        "{}|{}|{}|{}|{}",
        record.status.code(),
        format_timestamp(&record.created_at),
        completed,
        record.priority.as_str(),
        record.text
    ));
    out
}

pub fn encode_lines(records: &[FlatRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&encode_record(record));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::{assemble, flatten};
    use crate::models::{Subtask, Task};
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, min: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn now() -> Timestamp {
        at(30, 12, 0)
    }

    #[test]
    fn decodes_legacy_four_field_record() {
        let record = decode_line("0|2024-06-01T09:15:00|null|buy milk", now()).unwrap();
        assert_eq!(record.id, None);
        assert_eq!(record.text, "buy milk");
        assert_eq!(record.status, TaskStatus::Todo);
        assert_eq!(record.priority, Priority::Normal);
        assert_eq!(record.created_at, at(1, 9, 15));
        assert_eq!(record.parent, ParentRef::None);
    }

    #[test]
    fn decodes_legacy_done_record_with_fractional_seconds() {
        let record = decode_line(
            "1|2024-06-01T09:15:00.123456789|2024-06-01T10:00:00|ship it",
            now(),
        )
        .unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.completed_at, Some(at(1, 10, 0)));
        assert_eq!(
            record.created_at,
            at(1, 9, 15) + chrono::Duration::nanoseconds(123_456_789)
        );
    }

    #[test]
    fn non_numeric_status_is_legacy_boolean() {
        let todo = decode_line("true|2024-06-01T09:00:00|null|x", now()).unwrap();
        assert_eq!(todo.status, TaskStatus::Todo);
        let todo = decode_line("done|2024-06-01T09:00:00|null|x", now()).unwrap();
        assert_eq!(todo.status, TaskStatus::Todo);
        let done = decode_line(" 1 |2024-06-01T09:00:00|null|x", now()).unwrap();
        assert_eq!(done.status, TaskStatus::Done);
    }

    #[test]
    fn unknown_priority_name_falls_back_to_normal() {
        let record =
            decode_line("id=0a0b0c0d|0|2024-06-01T09:00:00|null|URGENT|call bob", now()).unwrap();
        assert_eq!(record.priority, Priority::Normal);
        assert_eq!(record.text, "call bob");
    }

    #[test]
    fn legacy_text_with_delimiter_is_kept_whole() {
        let record =
            decode_line("0|2024-06-01T09:00:00|null|compare a|b results", now()).unwrap();
        assert_eq!(record.text, "compare a|b results");
        assert_eq!(record.priority, Priority::Normal);

        let record = decode_line("0|2024-06-01T09:00:00|null|a|b|c", now()).unwrap();
        assert_eq!(record.text, "a|b|c");

        // A known priority name still marks the five-field layout.
        let record = decode_line("0|2024-06-01T09:00:00|null|high|a|b", now()).unwrap();
        assert_eq!(record.priority, Priority::High);
        assert_eq!(record.text, "a|b");
    }

    #[test]
    fn five_field_record_with_migrated_status() {
        let record = decode_line("2|2024-06-01T09:00:00|null|HIGH|old work", now()).unwrap();
        assert_eq!(record.status, TaskStatus::Migrated);
        assert_eq!(record.priority, Priority::High);
    }

    #[test]
    fn subtask_marker_links_to_previous() {
        let record = decode_line("SUB|0|2024-06-01T09:00:00|null|LOW|child", now()).unwrap();
        assert_eq!(record.parent, ParentRef::Previous);
        assert_eq!(record.priority, Priority::Low);
    }

    #[test]
    fn id_marker_is_read_before_status() {
        let record =
            decode_line("SUB|id=1a2b3c4d|0|2024-06-01T09:00:00|null|NORMAL|a|b", now()).unwrap();
        assert_eq!(record.id.as_deref(), Some("1a2b3c4d"));
        assert_eq!(record.text, "a|b");
        assert!(record.parent.is_subtask());
    }

    #[test]
    fn null_created_at_uses_load_time() {
        let record = decode_line("0|null|null|x", now()).unwrap();
        assert_eq!(record.created_at, now());
    }

    #[test]
    fn done_without_completion_time_is_repaired() {
        let record = decode_line("1|2024-06-01T09:00:00|null|x", now()).unwrap();
        assert_eq!(record.completed_at, Some(at(1, 9, 0)));
        let record = decode_line("0|2024-06-01T09:00:00|2024-06-01T10:00:00|x", now()).unwrap();
        assert_eq!(record.completed_at, None);
    }

    #[test]
    fn malformed_records_are_errors() {
        assert_eq!(
            decode_line("0|2024-06-01T09:00:00|null", now()),
            Err(DecodeError::Arity(3))
        );
        assert_eq!(
            decode_line("7|2024-06-01T09:00:00|null|x", now()),
            Err(DecodeError::UnknownStatus(7))
        );
        assert_eq!(
            decode_line("0|yesterday|null|x", now()),
            Err(DecodeError::Timestamp("yesterday".into()))
        );
        assert_eq!(
            decode_line("id=|0|2024-06-01T09:00:00|null|x", now()),
            Err(DecodeError::EmptyId)
        );
    }

    #[test]
    fn decode_lines_skips_bad_lines_and_keeps_going() {
        let content = "0|2024-06-01T09:00:00|null|first\r\n\
                       garbage\n\
                       \n\
                       1|2024-06-02T09:00:00|2024-06-02T11:00:00|second\n";
        let decoded = decode_lines(content, now());
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[0].text, "first");
        assert_eq!(decoded.skipped.len(), 1);
        assert_eq!(decoded.skipped[0].location, "line 2");
        assert_eq!(decoded.skipped[0].error, DecodeError::Arity(1));
    }

    #[test]
    fn encode_then_decode_restores_forest() {
        let mut parent = Task::new(
            "1a2b3c4d".into(),
            "parent | with pipe",
            Priority::Critical,
            at(1, 9, 0),
        );
        parent.created_at += chrono::Duration::nanoseconds(5_000);
        parent.toggle_done(at(1, 17, 30)).unwrap();
        let mut child = Subtask::new("5e6f7a8b".into(), "child", at(1, 10, 0));
        child.priority = Priority::Low;
        parent.subtasks.push(child);
        let mut migrated = Task::new("9c0d1e2f".into(), "", Priority::Normal, at(2, 8, 0));
        migrated.mark_migrated();
        let forest = vec![parent, migrated];

        let content = encode_lines(&flatten(&forest));
        assert!(content.starts_with("id=1a2b3c4d|1|"));
        assert!(content.contains("\nSUB|id=5e6f7a8b|0|"));

        let decoded = decode_lines(&content, now());
        assert!(decoded.skipped.is_empty());
        assert_eq!(assemble(decoded.records), forest);
    }
}
