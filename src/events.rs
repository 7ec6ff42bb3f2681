use std::sync::Arc;

use crate::models::Task;

/// Change notification emitted by the task store after each applied mutation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    Loaded { count: usize, skipped: usize },
    Replaced { count: usize },
    TaskAdded { id: String },
    SubtaskAdded { parent_id: String, id: String },
    TaskUpdated { id: String },
    TaskRemoved { id: String },
    Cleared,
    Migrated { count: usize },
    Purged { count: usize },
    Imported { count: usize },
}

pub type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatePayload {
    pub tasks: Vec<Task>,
    pub theme: String,
    pub pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(StoreEvent::Migrated { count: 2 }).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "migrated", "count": 2 }));
        let value = serde_json::to_value(StoreEvent::Cleared).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "cleared" }));
    }
}
