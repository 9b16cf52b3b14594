//! Application models
//!
//! A model is any `DeserializeOwned` type that lists its fields through
//! [`TableModel::fields`]. The decoder builds a JSON object keyed by field
//! name and hands it to serde, so fields missing from a message fall back to
//! their `#[serde(default)]` value.
//!
//! ```rust
//! use serde::Deserialize;
//! use tablewatch::{FieldKind, ModelField, TableModel};
//!
//! #[derive(Debug, Default, Deserialize)]
//! #[serde(default)]
//! struct Customer {
//!     id: i32,
//!     name: String,
//!     surname: Option<String>,
//! }
//!
//! impl TableModel for Customer {
//!     fn fields() -> Vec<ModelField> {
//!         vec![
//!             ModelField::new("id", FieldKind::I32),
//!             ModelField::new("name", FieldKind::String).column("FirstName"),
//!             ModelField::new("surname", FieldKind::String),
//!         ]
//!     }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Target representation of a model field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// `rust_decimal::Decimal`
    Decimal,
    String,
    /// `Vec<u8>`
    Bytes,
    /// `chrono::NaiveDate`
    Date,
    /// `chrono::NaiveTime`
    Time,
    /// `chrono::NaiveDateTime`
    DateTime,
    /// `chrono::DateTime<FixedOffset>`
    DateTimeOffset,
    /// `uuid::Uuid`
    Uuid,
    /// Enumeration deserialized from its numeric discriminant
    Enum,
    /// Wire value passed through untouched
    Raw,
}

/// One field declared by a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelField {
    /// Stable field identifier (the serde field name)
    pub name: &'static str,
    /// Target representation
    pub kind: FieldKind,
    /// Column declared on the field itself, used when neither an explicit
    /// mapping nor a name match resolves the field
    pub column: Option<&'static str>,
}

impl ModelField {
    /// Declare a field
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            column: None,
        }
    }

    /// Declare the column this field maps to
    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }
}

/// A type that change events can be decoded into
pub trait TableModel: DeserializeOwned + Send + Sync + 'static {
    /// Fields available for mapping
    fn fields() -> Vec<ModelField>;

    /// Table watched when the subscription names none; defaults to the type name
    fn table_name() -> String {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }

    /// Map every transportable column by its own name instead of using `fields()`
    fn is_dynamic() -> bool {
        false
    }
}

/// Dynamic row keyed by column name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Map<String, Value>);

impl RawRecord {
    /// Value of a column
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }
}

impl TableModel for RawRecord {
    fn fields() -> Vec<ModelField> {
        Vec::new()
    }

    fn is_dynamic() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize)]
    struct Customers {
        #[allow(dead_code)]
        id: i32,
    }

    impl TableModel for Customers {
        fn fields() -> Vec<ModelField> {
            vec![ModelField::new("id", FieldKind::I32).column("CustomerId")]
        }
    }

    #[test]
    fn test_default_table_name() {
        assert_eq!(Customers::table_name(), "Customers");
        assert_eq!(RawRecord::table_name(), "RawRecord");
    }

    #[test]
    fn test_field_declaration() {
        let fields = Customers::fields();
        assert_eq!(fields[0].name, "id");
        assert_eq!(fields[0].column, Some("CustomerId"));
        assert!(!Customers::is_dynamic());
        assert!(RawRecord::is_dynamic());
    }
}
