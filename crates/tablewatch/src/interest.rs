//! DML filter and update-of interest set

use crate::error::{Result, TableWatchError};
use crate::event::ChangeType;
use crate::mapper::ColumnMapping;
use crate::schema::TableDescriptor;
use bitflags::bitflags;

bitflags! {
    /// Which DML operations produce notifications
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmlTriggerFilter: u8 {
        const INSERT = 0b001;
        const UPDATE = 0b010;
        const DELETE = 0b100;
    }
}

impl Default for DmlTriggerFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl DmlTriggerFilter {
    /// Whether a change type is enabled
    pub fn includes(&self, change: ChangeType) -> bool {
        self.contains(Self::from(change))
    }

    /// Enabled change types in provisioning order
    pub fn change_types(&self) -> Vec<ChangeType> {
        ChangeType::ALL
            .into_iter()
            .filter(|c| self.includes(*c))
            .collect()
    }
}

impl From<ChangeType> for DmlTriggerFilter {
    fn from(change: ChangeType) -> Self {
        match change {
            ChangeType::Insert => Self::INSERT,
            ChangeType::Update => Self::UPDATE,
            ChangeType::Delete => Self::DELETE,
        }
    }
}

/// Columns whose value change makes an Update notifiable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InterestSet {
    /// Every column carried in the payload
    #[default]
    All,
    /// Explicit update-of list, spelled as in the table
    Columns(Vec<String>),
}

impl InterestSet {
    /// Build from an optional update-of list.
    pub fn build(explicit: Option<&[String]>, table: &TableDescriptor) -> Result<Self> {
        let Some(list) = explicit else {
            return Ok(Self::All);
        };

        Self::check_shape(list)?;

        let mut columns: Vec<String> = Vec::with_capacity(list.len());
        for entry in list {
            let column = table.column(entry.trim()).ok_or_else(|| {
                TableWatchError::update_of(format!(
                    "column '{}' does not exist in table '{}'",
                    entry,
                    table.qualified_name()
                ))
            })?;

            if !column.is_comparable() {
                return Err(TableWatchError::update_of(format!(
                    "column '{}' of type '{}'{} cannot be compared for changes",
                    column.name,
                    column.native_type,
                    if column.is_computed { " (computed)" } else { "" }
                )));
            }

            if !columns.contains(&column.name) {
                columns.push(column.name.clone());
            }
        }

        Ok(Self::Columns(columns))
    }

    /// Reject empty lists and blank entries without touching the database.
    pub fn check_shape(list: &[String]) -> Result<()> {
        if list.is_empty() {
            return Err(TableWatchError::update_of("update-of list is empty"));
        }
        if list.iter().any(|c| c.trim().is_empty()) {
            return Err(TableWatchError::update_of(
                "update-of list contains a blank column name",
            ));
        }
        Ok(())
    }

    /// Whether an explicit list was given
    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Columns(_))
    }

    /// Columns the trigger compares between old and new images
    pub fn comparison_columns(
        &self,
        mapping: &ColumnMapping,
        table: &TableDescriptor,
    ) -> Vec<String> {
        match self {
            Self::Columns(columns) => columns.clone(),
            Self::All => mapping
                .columns()
                .filter_map(|c| table.column(c))
                .filter(|c| c.is_comparable())
                .map(|c| c.name.clone())
                .collect(),
        }
    }
}

/// An explicit interest set is meaningless when updates are filtered out.
pub fn validate_filter(interest: &InterestSet, filter: DmlTriggerFilter) -> Result<()> {
    if filter.is_empty() {
        return Err(TableWatchError::config(
            "DML trigger filter must enable at least one of Insert, Update, Delete",
        ));
    }
    if interest.is_explicit() && !filter.contains(DmlTriggerFilter::UPDATE) {
        return Err(TableWatchError::DmlTriggerType(
            "an update-of list requires Update notifications to be enabled".to_string(),
        ));
    }
    Ok(())
}

/// Validate the shape of an optional update-of list together with the filter
pub fn validate_update_of(
    update_of: Option<&[String]>,
    filter: DmlTriggerFilter,
) -> Result<()> {
    if let Some(list) = update_of {
        InterestSet::check_shape(list)?;
        validate_filter(&InterestSet::Columns(list.to_vec()), filter)?;
    } else {
        validate_filter(&InterestSet::All, filter)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDescriptor;

    fn table() -> TableDescriptor {
        TableDescriptor::new(
            "dbo",
            "Items",
            vec![
                ColumnDescriptor::new("Id", "int").primary_key(1),
                ColumnDescriptor::new("Name", "nvarchar"),
                ColumnDescriptor::new("Price", "decimal"),
                ColumnDescriptor::new("Total", "decimal").computed(),
                ColumnDescriptor::new("Spec", "xml"),
            ],
        )
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_filter_enables_everything() {
        let filter = DmlTriggerFilter::default();
        assert_eq!(
            filter.change_types(),
            vec![ChangeType::Insert, ChangeType::Update, ChangeType::Delete]
        );
        let filter = DmlTriggerFilter::INSERT | DmlTriggerFilter::DELETE;
        assert!(!filter.includes(ChangeType::Update));
    }

    #[test]
    fn test_build_interest_set() {
        assert_eq!(InterestSet::build(None, &table()).unwrap(), InterestSet::All);

        let set = InterestSet::build(Some(&list(&["name", "PRICE", "Name"])), &table()).unwrap();
        assert_eq!(set, InterestSet::Columns(list(&["Name", "Price"])));
    }

    #[test]
    fn test_malformed_lists() {
        for bad in [list(&[]), list(&["Name", ""]), list(&["  "]), list(&["Nope"])] {
            let err = InterestSet::build(Some(&bad), &table()).unwrap_err();
            assert!(matches!(err, TableWatchError::UpdateOf(_)), "{:?}", bad);
        }
    }

    #[test]
    fn test_non_comparable_columns_rejected() {
        assert!(InterestSet::build(Some(&list(&["Total"])), &table()).is_err());
        assert!(InterestSet::build(Some(&list(&["Spec"])), &table()).is_err());
    }

    #[test]
    fn test_filter_combination() {
        let explicit = InterestSet::Columns(list(&["Name"]));
        let err = validate_filter(&explicit, DmlTriggerFilter::INSERT).unwrap_err();
        assert!(matches!(err, TableWatchError::DmlTriggerType(_)));

        assert!(validate_filter(&explicit, DmlTriggerFilter::UPDATE).is_ok());
        assert!(validate_filter(&InterestSet::All, DmlTriggerFilter::DELETE).is_ok());
        assert!(validate_filter(&InterestSet::All, DmlTriggerFilter::empty()).is_err());
    }

    #[test]
    fn test_validate_update_of_before_connecting() {
        let empty: Vec<String> = vec![];
        assert!(matches!(
            validate_update_of(Some(&empty), DmlTriggerFilter::all()),
            Err(TableWatchError::UpdateOf(_))
        ));
        assert!(matches!(
            validate_update_of(Some(&list(&["Name"])), DmlTriggerFilter::INSERT),
            Err(TableWatchError::DmlTriggerType(_))
        ));
        assert!(validate_update_of(None, DmlTriggerFilter::INSERT).is_ok());
    }
}
