//! Table metadata and introspection
//!
//! Column metadata drives three decisions: which columns a model may map,
//! which columns the trigger projects into the payload, and which columns the
//! trigger compares to detect an actual value change on Update.

use crate::error::{Result, TableWatchError};
use crate::session::SqlSession;
use crate::validation::Validator;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Types the trigger cannot read from `inserted`/`deleted` or FOR JSON cannot serialize
const UNSUPPORTED_TYPES: &[&str] = &[
    "text",
    "ntext",
    "image",
    "geography",
    "geometry",
    "hierarchyid",
    "sql_variant",
];

/// Types that cannot take part in `EXCEPT` comparisons
const NON_COMPARABLE_TYPES: &[&str] = &["xml"];

/// Exact numerics projected as strings so scale survives the JSON hop
const EXACT_NUMERIC_TYPES: &[&str] = &["decimal", "numeric", "money", "smallmoney"];

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Native type name, lowercase (e.g. `nvarchar`, `datetime2`)
    pub native_type: String,
    /// Whether the column accepts NULL
    pub nullable: bool,
    /// Declared max length in bytes (-1 for MAX types)
    pub max_length: Option<i32>,
    /// Numeric precision
    pub precision: Option<u8>,
    /// Numeric scale / fractional seconds precision
    pub scale: Option<u8>,
    /// Computed column
    pub is_computed: bool,
    /// Position within the primary key (1-based)
    pub primary_key_ordinal: Option<u8>,
}

impl ColumnDescriptor {
    /// Create a nullable, non-key column of the given type
    pub fn new(name: impl Into<String>, native_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            native_type: native_type.into().to_lowercase(),
            nullable: true,
            max_length: None,
            precision: None,
            scale: None,
            is_computed: false,
            primary_key_ordinal: None,
        }
    }

    /// Mark as NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as part of the primary key
    pub fn primary_key(mut self, ordinal: u8) -> Self {
        self.primary_key_ordinal = Some(ordinal);
        self.nullable = false;
        self
    }

    /// Mark as computed
    pub fn computed(mut self) -> Self {
        self.is_computed = true;
        self
    }

    /// Set precision and scale
    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Set max length in bytes
    pub fn with_max_length(mut self, max_length: i32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Whether the column can be carried in a change message
    pub fn is_transportable(&self) -> bool {
        !UNSUPPORTED_TYPES.contains(&self.native_type.as_str())
    }

    /// Whether the trigger may compare old and new values of this column
    pub fn is_comparable(&self) -> bool {
        self.is_transportable()
            && !self.is_computed
            && !NON_COMPARABLE_TYPES.contains(&self.native_type.as_str())
    }

    /// Whether the column is an exact numeric projected as text
    pub fn is_exact_numeric(&self) -> bool {
        EXACT_NUMERIC_TYPES.contains(&self.native_type.as_str())
    }

    /// Whether values travel base64-encoded
    pub fn is_binary(&self) -> bool {
        matches!(
            self.native_type.as_str(),
            "binary" | "varbinary" | "timestamp" | "rowversion"
        )
    }

    /// Whether the column is declared with MAX length
    pub fn is_max(&self) -> bool {
        self.max_length == Some(-1)
    }
}

/// Table metadata, immutable once validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Schema name
    pub schema: String,
    /// Table name
    pub name: String,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Create a descriptor
    pub fn new(
        schema: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
    ) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns,
        }
    }

    /// Find a column, case-insensitively
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
            })
    }

    /// Primary key columns in key order
    pub fn primary_key(&self) -> Vec<&ColumnDescriptor> {
        let mut pk: Vec<_> = self
            .columns
            .iter()
            .filter(|c| c.primary_key_ordinal.is_some())
            .collect();
        pk.sort_by_key(|c| c.primary_key_ordinal);
        pk
    }

    /// `schema.table` for messages
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Reads and validates table metadata
pub struct SchemaIntrospector;

impl SchemaIntrospector {
    /// Describe a table, failing with `NotExistingTable` when absent.
    pub async fn describe(
        session: &mut dyn SqlSession,
        schema: &str,
        table: &str,
    ) -> Result<TableDescriptor> {
        Validator::validate_identifier(schema)?;
        Validator::validate_identifier(table)?;

        let descriptor = session
            .describe_table(schema, table)
            .await?
            .filter(|d| !d.columns.is_empty())
            .ok_or_else(|| TableWatchError::NotExistingTable {
                schema: schema.to_string(),
                table: table.to_string(),
            })?;

        debug!(
            "Described {} with {} columns ({} not transportable)",
            descriptor.qualified_name(),
            descriptor.columns.len(),
            descriptor
                .columns
                .iter()
                .filter(|c| !c.is_transportable())
                .count()
        );

        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> TableDescriptor {
        TableDescriptor::new(
            "dbo",
            "Customers",
            vec![
                ColumnDescriptor::new("Id", "int").primary_key(1),
                ColumnDescriptor::new("Name", "NVARCHAR").with_max_length(100),
                ColumnDescriptor::new("Balance", "decimal").with_precision(18, 4),
                ColumnDescriptor::new("Notes", "ntext"),
                ColumnDescriptor::new("Doc", "xml"),
                ColumnDescriptor::new("FullName", "nvarchar").computed(),
            ],
        )
    }

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        let table = customers();
        assert_eq!(table.column("name").unwrap().name, "Name");
        assert_eq!(table.column("ID").unwrap().name, "Id");
        assert!(table.column("Missing").is_none());
    }

    #[test]
    fn test_type_classification() {
        let table = customers();
        assert_eq!(table.column("Name").unwrap().native_type, "nvarchar");
        assert!(table.column("Balance").unwrap().is_exact_numeric());
        assert!(!table.column("Notes").unwrap().is_transportable());
        assert!(table.column("Doc").unwrap().is_transportable());
        assert!(!table.column("Doc").unwrap().is_comparable());
        assert!(table.column("FullName").unwrap().is_transportable());
        assert!(!table.column("FullName").unwrap().is_comparable());
        assert!(table.column("Id").unwrap().is_comparable());
    }

    #[test]
    fn test_primary_key_order() {
        let table = TableDescriptor::new(
            "dbo",
            "Lines",
            vec![
                ColumnDescriptor::new("LineNo", "int").primary_key(2),
                ColumnDescriptor::new("OrderId", "int").primary_key(1),
                ColumnDescriptor::new("Qty", "int"),
            ],
        );
        let pk: Vec<_> = table.primary_key().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(pk, vec!["OrderId", "LineNo"]);
    }
}
