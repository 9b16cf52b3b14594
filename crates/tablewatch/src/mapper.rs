//! Field-to-column mapping
//!
//! Resolution order per model field: explicit mapping, then a
//! case-insensitive name match, then the column declared on the field. The
//! first match wins and no column is claimed twice.

use crate::error::{Result, TableWatchError};
use crate::model::{FieldKind, ModelField, TableModel};
use crate::schema::TableDescriptor;
use std::collections::HashSet;
use tracing::{debug, warn};

/// How a field found its column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingSource {
    /// Added through [`ModelToTableMapper::add_mapping`]
    Explicit,
    /// Field name equals the column name, ignoring case
    NameMatch,
    /// Column declared on the model field
    FieldAttribute,
    /// Column exposed on a dynamic model
    Dynamic,
}

/// One resolved field ↔ column pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedColumn {
    /// Model field name
    pub field: String,
    /// Column name as spelled in the table
    pub column: String,
    /// Target representation
    pub kind: FieldKind,
    /// Resolution source
    pub source: MappingSource,
}

/// Validated bidirectional mapping between model fields and table columns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    entries: Vec<MappedColumn>,
}

impl ColumnMapping {
    /// Resolved pairs in table column order
    pub fn entries(&self) -> &[MappedColumn] {
        &self.entries
    }

    /// Mapped column names in table column order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.column.as_str())
    }

    /// Entry for a column (case-insensitive)
    pub fn by_column(&self, column: &str) -> Option<&MappedColumn> {
        self.entries
            .iter()
            .find(|e| e.column.eq_ignore_ascii_case(column))
    }

    /// Entry for a field
    pub fn by_field(&self, field: &str) -> Option<&MappedColumn> {
        self.entries.iter().find(|e| e.field == field)
    }

    /// Number of mapped columns
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Explicit field-to-column overrides
#[derive(Debug, Clone, Default)]
pub struct ModelToTableMapper {
    mappings: Vec<(String, String)>,
}

impl ModelToTableMapper {
    /// Create an empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a model field to a column
    pub fn add_mapping(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.mappings.push((field.into(), column.into()));
        self
    }

    /// Number of explicit mappings
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether no explicit mapping was added
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Resolve a model against a table
    pub fn resolve<T: TableModel>(&self, table: &TableDescriptor) -> Result<ColumnMapping> {
        self.resolve_fields(
            &T::fields(),
            T::is_dynamic(),
            std::any::type_name::<T>(),
            table,
        )
    }

    /// Resolve a field list against a table.
    pub fn resolve_fields(
        &self,
        fields: &[ModelField],
        dynamic: bool,
        model_name: &str,
        table: &TableDescriptor,
    ) -> Result<ColumnMapping> {
        let mut resolved: Vec<MappedColumn> = Vec::new();
        let mut claimed_fields: HashSet<String> = HashSet::new();
        let mut claimed_columns: HashSet<String> = HashSet::new();

        for (field, column) in &self.mappings {
            if field.trim().is_empty() {
                return Err(TableWatchError::mapper(format!(
                    "mapping to column '{}' has a blank field name",
                    column
                )));
            }
            if column.trim().is_empty() {
                return Err(TableWatchError::mapper(format!(
                    "field '{}' is mapped to a blank column name",
                    field
                )));
            }

            let kind = match fields.iter().find(|f| f.name == field) {
                Some(f) => f.kind,
                None if dynamic => FieldKind::Raw,
                None => {
                    return Err(TableWatchError::mapper(format!(
                        "field '{}' is not declared by model '{}'",
                        field, model_name
                    )))
                }
            };

            let descriptor = table.column(column).ok_or_else(|| {
                TableWatchError::mapper(format!(
                    "column '{}' mapped from field '{}' does not exist in table '{}'",
                    column,
                    field,
                    table.qualified_name()
                ))
            })?;

            if !descriptor.is_transportable() {
                return Err(TableWatchError::mapper(format!(
                    "column '{}' of type '{}' cannot be carried in change messages",
                    descriptor.name, descriptor.native_type
                )));
            }

            if !claimed_fields.insert(field.clone()) {
                return Err(TableWatchError::mapper(format!(
                    "field '{}' is mapped more than once",
                    field
                )));
            }
            if !claimed_columns.insert(descriptor.name.to_lowercase()) {
                return Err(TableWatchError::mapper(format!(
                    "column '{}' is the target of more than one mapping",
                    descriptor.name
                )));
            }

            resolved.push(MappedColumn {
                field: field.clone(),
                column: descriptor.name.clone(),
                kind,
                source: MappingSource::Explicit,
            });
        }

        for field in fields {
            if claimed_fields.contains(field.name) {
                continue;
            }

            let by_name = table
                .columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(field.name))
                .filter(|c| c.is_transportable())
                .filter(|c| !claimed_columns.contains(&c.name.to_lowercase()));

            let (descriptor, source) = match by_name {
                Some(c) => (c, MappingSource::NameMatch),
                None => match field.column {
                    Some(column) => {
                        let descriptor = table.column(column).ok_or_else(|| {
                            TableWatchError::mapper(format!(
                                "column '{}' declared on field '{}' does not exist in table '{}'",
                                column,
                                field.name,
                                table.qualified_name()
                            ))
                        })?;
                        if claimed_columns.contains(&descriptor.name.to_lowercase()) {
                            return Err(TableWatchError::mapper(format!(
                                "column '{}' declared on field '{}' is already mapped",
                                descriptor.name, field.name
                            )));
                        }
                        if !descriptor.is_transportable() {
                            return Err(TableWatchError::mapper(format!(
                                "column '{}' of type '{}' cannot be carried in change messages",
                                descriptor.name, descriptor.native_type
                            )));
                        }
                        (descriptor, MappingSource::FieldAttribute)
                    }
                    None => {
                        debug!("Field '{}' has no matching column", field.name);
                        continue;
                    }
                },
            };

            claimed_fields.insert(field.name.to_string());
            claimed_columns.insert(descriptor.name.to_lowercase());
            resolved.push(MappedColumn {
                field: field.name.to_string(),
                column: descriptor.name.clone(),
                kind: field.kind,
                source,
            });
        }

        if dynamic {
            for column in &table.columns {
                if claimed_columns.contains(&column.name.to_lowercase()) {
                    continue;
                }
                if !column.is_transportable() {
                    warn!(
                        "Skipping column '{}' of type '{}': not transportable",
                        column.name, column.native_type
                    );
                    continue;
                }
                claimed_columns.insert(column.name.to_lowercase());
                resolved.push(MappedColumn {
                    field: column.name.clone(),
                    column: column.name.clone(),
                    kind: FieldKind::Raw,
                    source: MappingSource::Dynamic,
                });
            }
        }

        if resolved.is_empty() {
            return Err(TableWatchError::NoMatchBetweenModelAndTableColumns {
                model: model_name.to_string(),
                table: table.qualified_name(),
            });
        }

        // keep payload projection in table column order
        resolved.sort_by_key(|entry| {
            table
                .columns
                .iter()
                .position(|c| c.name == entry.column)
                .unwrap_or(usize::MAX)
        });

        Ok(ColumnMapping { entries: resolved })
    }
}
