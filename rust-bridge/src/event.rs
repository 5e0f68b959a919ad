//! Event model.
//!
//! An event is any serializable record with a stable, caller-assigned id. The
//! bridge only ever reads the id and ships the whole record as the job payload.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An identified unit of domain data.
///
/// Implementations must be safe to share between concurrently running
/// strategies and handlers.
pub trait Event: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Stable unique identifier of this event
    fn id(&self) -> &str;
}

/// Schemaless event: an id plus arbitrary payload fields.
///
/// Serializes flat, so `{"id": "e1", "foo": 1}` round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event identifier
    pub id: String,
    /// Remaining payload fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventRecord {
    /// Create an empty event with a random id.
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Create an empty event with the given id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Add a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

impl Default for EventRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl Event for EventRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_record_serializes_flat() {
        let event = EventRecord::with_id("e1").with_field("foo", 1);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"id": "e1", "foo": 1}));

        let parsed: EventRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.field("foo"), Some(&json!(1)));
    }

    #[test]
    fn test_new_events_get_distinct_ids() {
        let a = EventRecord::new();
        let b = EventRecord::new();

        assert!(!a.id().is_empty());
        assert_ne!(a.id(), b.id());
    }
}
