//! Change sets of mutable views.
//!
//! A [`DirtySnapshot`] lists the updatable attributes that changed since the
//! instance was constructed or last reset. The flush collaborator turns it
//! into a [`FlushRecord`] and calls `reset_dirty` once it has persisted it.

use super::types::Value;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// One changed attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyEntry {
    /// Position in the dirty bitset.
    pub dirty_index: usize,
    /// Position among the view type's attributes.
    pub attribute_index: usize,
    pub attribute: SmolStr,
    pub initial: Value,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirtySnapshot {
    pub view: SmolStr,
    pub id: Option<Value>,
    /// Ordered by dirty index.
    pub entries: Vec<DirtyEntry>,
}

impl DirtySnapshot {
    pub fn new(view: SmolStr, id: Option<Value>, entries: Vec<DirtyEntry>) -> Self {
        DirtySnapshot { view, id, entries }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, attribute: &str) -> Option<&DirtyEntry> {
        self.entries.iter().find(|e| e.attribute == attribute)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &SmolStr> {
        self.entries.iter().map(|e| &e.attribute)
    }

    pub fn to_record(&self) -> FlushRecord {
        let id = self.id.as_ref().filter(|id| !id.is_null());
        FlushRecord {
            view: self.view.clone(),
            event: if id.is_some() {
                FlushEvent::Updated
            } else {
                FlushEvent::Created
            },
            id: id.map(Value::to_json).unwrap_or(serde_json::Value::Null),
            changes: self
                .entries
                .iter()
                .map(|e| FieldChange {
                    attribute: e.attribute.clone(),
                    value: e.value.to_json(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlushEvent {
    /// The instance has no identity yet.
    Created,
    Updated,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub attribute: SmolStr,
    pub value: serde_json::Value,
}

/// Serializable form of a snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FlushRecord {
    pub view: SmolStr,
    pub event: FlushEvent,
    pub id: serde_json::Value,
    pub changes: Vec<FieldChange>,
}

#[cfg(test)]
mod update_tests {
    use super::*;

    fn entry(attribute: &str, value: Value) -> DirtyEntry {
        DirtyEntry {
            dirty_index: 0,
            attribute_index: 1,
            attribute: SmolStr::new(attribute),
            initial: Value::Null,
            value,
        }
    }

    #[test]
    fn test_record_for_existing_instance() {
        let snapshot = DirtySnapshot::new(
            "Person".into(),
            Some(Value::from(7)),
            vec![entry("name", Value::from("Bob"))],
        );
        let record = snapshot.to_record();
        assert_eq!(record.event, FlushEvent::Updated);
        assert_eq!(record.id, serde_json::json!(7));
        assert_eq!(record.changes.len(), 1);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "updated");
        assert_eq!(json["changes"][0]["attribute"], "name");
        assert_eq!(json["changes"][0]["value"], "Bob");
    }

    #[test]
    fn test_record_without_identity_is_created() {
        let snapshot = DirtySnapshot::new("Person".into(), Some(Value::Null), vec![]);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.to_record().event, FlushEvent::Created);
    }

    #[test]
    fn test_get_by_attribute() {
        let snapshot = DirtySnapshot::new(
            "Person".into(),
            None,
            vec![entry("name", Value::from("A")), entry("age", Value::from(3))],
        );
        assert_eq!(snapshot.get("age").map(|e| &e.value), Some(&Value::from(3)));
        assert!(snapshot.get("missing").is_none());
        assert_eq!(snapshot.attributes().count(), 2);
    }
}
