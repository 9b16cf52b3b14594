//! Change events raised to the application

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl ChangeType {
    /// All change types, in provisioning order
    pub const ALL: [ChangeType; 3] = [ChangeType::Insert, ChangeType::Update, ChangeType::Delete];

    /// Name used in message type names
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "Insert",
            ChangeType::Update => "Update",
            ChangeType::Delete => "Delete",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Insert" => Ok(ChangeType::Insert),
            "Update" => Ok(ChangeType::Update),
            "Delete" => Ok(ChangeType::Delete),
            other => Err(format!("unknown change type '{}'", other)),
        }
    }
}

/// One changed row, decoded into the subscription's model.
///
/// Produced once per affected row per statement, in the order the queue
/// delivers them.
#[derive(Debug, Clone)]
pub struct ChangeEvent<T> {
    /// Kind of change
    pub change_type: ChangeType,
    /// Row image: new values for Insert/Update, deleted values for Delete
    pub entity: T,
    /// Previous values on Update, when old values were requested
    pub old_entity: Option<T>,
    /// Column values as carried on the wire, keyed by column name
    pub raw_values: Map<String, Value>,
}

impl<T> ChangeEvent<T> {
    /// Create a new event without old values
    pub fn new(change_type: ChangeType, entity: T, raw_values: Map<String, Value>) -> Self {
        Self {
            change_type,
            entity,
            old_entity: None,
            raw_values,
        }
    }

    /// Attach the previous row image
    pub fn with_old_entity(mut self, old: T) -> Self {
        self.old_entity = Some(old);
        self
    }

    /// Raw wire value of a column (case-insensitive)
    pub fn raw_value(&self, column: &str) -> Option<&Value> {
        self.raw_values.get(column).or_else(|| {
            self.raw_values
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(column))
                .map(|(_, v)| v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_type_roundtrip_names() {
        for change in ChangeType::ALL {
            assert_eq!(change.to_string().parse::<ChangeType>().unwrap(), change);
        }
        assert!("Merge".parse::<ChangeType>().is_err());
    }

    #[test]
    fn test_raw_value_lookup() {
        let mut raw = Map::new();
        raw.insert("FirstName".to_string(), json!("Ada"));
        let event = ChangeEvent::new(ChangeType::Insert, (), raw);

        assert_eq!(event.raw_value("FirstName"), Some(&json!("Ada")));
        assert_eq!(event.raw_value("firstname"), Some(&json!("Ada")));
        assert!(event.raw_value("LastName").is_none());
        assert!(event.old_entity.is_none());
    }
}
