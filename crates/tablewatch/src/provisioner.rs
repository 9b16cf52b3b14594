//! Provisioning and teardown of Service Broker objects
//!
//! ```text
//!  DML on [schema].[table]
//!        │ (same transaction)
//!        ▼
//!  tr_{token}_Sender ── one message per affected row ──▶ [schema].[{token}] queue
//!                         {token}/Insert|Update|Delete          │
//!                         on contract {token}                    ▼
//!                                                       service {token} ◀── WAITFOR (RECEIVE)
//! ```
//!
//! Messages are JSON documents produced with `FOR JSON PATH`:
//!
//! ```json
//! {"row": {"Id": 1, "Price": "12.5000"}, "old": {"Id": 1, "Price": "10.0000"}}
//! ```
//!
//! `row` is the inserted/updated image (the deleted image for Delete); `old`
//! is present on Update only when old values were requested. Exact numerics
//! travel as strings, binary values as base64 and NULLs are omitted.

use crate::error::{Result, TableWatchError};
use crate::event::ChangeType;
use crate::interest::{DmlTriggerFilter, InterestSet};
use crate::mapper::ColumnMapping;
use crate::naming::{NamingConvention, ObjectRole};
use crate::schema::{ColumnDescriptor, TableDescriptor};
use crate::session::SqlSession;
use crate::validation::{quote_identifier, quote_literal, quote_qualified};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use tracing::{debug, error, info, warn};

/// Alias of the `deleted` set inside the update comparison
const PREVIOUS_ALIAS: &str = "prev";

/// Kind of database object owned by a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    MessageType,
    Contract,
    Queue,
    Service,
    Trigger,
    /// Open conversations of the subscription's service
    ConversationEndpoints,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::MessageType => "message type",
            ObjectKind::Contract => "contract",
            ObjectKind::Queue => "queue",
            ObjectKind::Service => "service",
            ObjectKind::Trigger => "trigger",
            ObjectKind::ConversationEndpoints => "conversation endpoints",
        };
        f.write_str(name)
    }
}

/// A named database object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProvisionedObject {
    pub kind: ObjectKind,
    pub name: String,
}

impl ProvisionedObject {
    pub fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ProvisionedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// Create or drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlAction {
    Create,
    Drop,
}

/// One DDL batch together with the object it affects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlStatement {
    pub action: DdlAction,
    pub object: ProvisionedObject,
    pub sql: String,
}

/// Columns carried in Update payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadScope {
    /// Every mapped column
    #[default]
    MappedColumns,
    /// Only mapped columns that belong to the interest set
    InterestColumns,
}

/// Outcome of a best-effort teardown
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Statements that succeeded
    pub executed: usize,
    /// Objects whose drop failed, with the error text
    pub failures: Vec<(ProvisionedObject, String)>,
}

impl TeardownReport {
    /// Whether every drop succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything needed to generate a subscription's DDL
#[derive(Debug, Clone)]
pub struct ObjectProvisioner {
    naming: NamingConvention,
    table: TableDescriptor,
    mapping: ColumnMapping,
    interest: InterestSet,
    filter: DmlTriggerFilter,
    include_old_values: bool,
    payload_scope: PayloadScope,
}

impl ObjectProvisioner {
    pub fn new(
        naming: NamingConvention,
        table: TableDescriptor,
        mapping: ColumnMapping,
        interest: InterestSet,
        filter: DmlTriggerFilter,
    ) -> Self {
        Self {
            naming,
            table,
            mapping,
            interest,
            filter,
            include_old_values: false,
            payload_scope: PayloadScope::default(),
        }
    }

    /// Carry the previous image on Update
    pub fn include_old_values(mut self, include: bool) -> Self {
        self.include_old_values = include;
        self
    }

    /// Restrict Update payloads
    pub fn payload_scope(mut self, scope: PayloadScope) -> Self {
        self.payload_scope = scope;
        self
    }

    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    /// Objects created by [`create_statements`](Self::create_statements)
    pub fn objects(&self) -> Vec<ProvisionedObject> {
        self.create_statements()
            .into_iter()
            .map(|s| s.object)
            .collect()
    }

    /// DDL in creation order: message types, contract, queue, service, trigger
    pub fn create_statements(&self) -> Vec<DdlStatement> {
        let token = &self.naming;
        let schema = &self.table.schema;
        let changes = self.filter.change_types();
        let mut statements = Vec::with_capacity(changes.len() + 4);

        for change in &changes {
            let name = token.message_type(*change);
            statements.push(DdlStatement {
                action: DdlAction::Create,
                sql: format!(
                    "CREATE MESSAGE TYPE {} VALIDATION = NONE;",
                    quote_identifier(&name)
                ),
                object: ProvisionedObject::new(ObjectKind::MessageType, name),
            });
        }

        let contract = token.compose(ObjectRole::Contract);
        let bindings = changes
            .iter()
            .map(|c| format!("{} SENT BY INITIATOR", quote_identifier(&token.message_type(*c))))
            .collect::<Vec<_>>()
            .join(", ");
        statements.push(DdlStatement {
            action: DdlAction::Create,
            sql: format!(
                "CREATE CONTRACT {} ({});",
                quote_identifier(&contract),
                bindings
            ),
            object: ProvisionedObject::new(ObjectKind::Contract, contract.clone()),
        });

        let queue = token.compose(ObjectRole::Queue);
        statements.push(DdlStatement {
            action: DdlAction::Create,
            sql: format!(
                "CREATE QUEUE {} WITH STATUS = ON, RETENTION = OFF, POISON_MESSAGE_HANDLING (STATUS = OFF);",
                quote_qualified(schema, &queue)
            ),
            object: ProvisionedObject::new(ObjectKind::Queue, queue.clone()),
        });

        let service = token.compose(ObjectRole::Service);
        statements.push(DdlStatement {
            action: DdlAction::Create,
            sql: format!(
                "CREATE SERVICE {} ON QUEUE {} ({});",
                quote_identifier(&service),
                quote_qualified(schema, &queue),
                quote_identifier(&contract)
            ),
            object: ProvisionedObject::new(ObjectKind::Service, service),
        });

        statements.push(DdlStatement {
            action: DdlAction::Create,
            sql: self.trigger_sql(),
            object: ProvisionedObject::new(
                ObjectKind::Trigger,
                token.compose(ObjectRole::Trigger),
            ),
        });

        statements
    }

    /// Columns projected into Insert/Delete payloads
    fn payload_columns(&self) -> Vec<&ColumnDescriptor> {
        self.mapping
            .columns()
            .filter_map(|c| self.table.column(c))
            .collect()
    }

    /// Columns projected into Update payloads
    fn update_payload_columns(&self, comparison: &[String]) -> Vec<&ColumnDescriptor> {
        match self.payload_scope {
            PayloadScope::MappedColumns => self.payload_columns(),
            PayloadScope::InterestColumns => self
                .payload_columns()
                .into_iter()
                .filter(|c| comparison.iter().any(|name| *name == c.name))
                .collect(),
        }
    }

    /// Body of the per-row trigger
    pub fn trigger_sql(&self) -> String {
        let token = &self.naming;
        let schema = &self.table.schema;
        let service = token.compose(ObjectRole::Service);
        let contract = token.compose(ObjectRole::Contract);
        let comparison = self.interest.comparison_columns(&self.mapping, &self.table);
        let changes = self.filter.change_types();

        let mut sql = String::new();
        let _ = writeln!(
            sql,
            "CREATE TRIGGER {} ON {}",
            quote_qualified(schema, &token.compose(ObjectRole::Trigger)),
            quote_qualified(schema, &self.table.name)
        );
        let _ = writeln!(sql, "AFTER INSERT, UPDATE, DELETE");
        let _ = writeln!(sql, "AS");
        let _ = writeln!(sql, "BEGIN");
        let _ = writeln!(sql, "    SET NOCOUNT ON;");
        let _ = writeln!(sql);
        let _ = writeln!(
            sql,
            "    IF NOT EXISTS (SELECT * FROM sys.services WHERE name = {}) RETURN;",
            quote_literal(&service)
        );
        let _ = writeln!(sql);
        let _ = writeln!(sql, "    DECLARE @dmlType NVARCHAR(10);");
        let _ = writeln!(
            sql,
            "    IF EXISTS (SELECT * FROM inserted) AND EXISTS (SELECT * FROM deleted) SET @dmlType = N'Update';"
        );
        let _ = writeln!(
            sql,
            "    ELSE IF EXISTS (SELECT * FROM inserted) SET @dmlType = N'Insert';"
        );
        let _ = writeln!(
            sql,
            "    ELSE IF EXISTS (SELECT * FROM deleted) SET @dmlType = N'Delete';"
        );
        let _ = writeln!(sql, "    ELSE RETURN;");
        let _ = writeln!(sql);
        let _ = writeln!(
            sql,
            "    DECLARE @messages TABLE ([seq] INT IDENTITY(1,1) NOT NULL, [body] NVARCHAR(MAX) NOT NULL);"
        );

        for change in &changes {
            let _ = writeln!(sql);
            let _ = writeln!(sql, "    IF @dmlType = N'{}'", change);
            let _ = writeln!(sql, "        INSERT INTO @messages ([body])");
            match change {
                ChangeType::Insert => {
                    let body = json_document(&[("row", "i", &self.payload_columns())]);
                    let _ = writeln!(sql, "        SELECT {}", body);
                    let _ = writeln!(sql, "        FROM inserted AS i;");
                }
                ChangeType::Delete => {
                    let body = json_document(&[("row", "d", &self.payload_columns())]);
                    let _ = writeln!(sql, "        SELECT {}", body);
                    let _ = writeln!(sql, "        FROM deleted AS d;");
                }
                ChangeType::Update => {
                    let columns = self.update_payload_columns(&comparison);
                    let pairs_old = self.pairs_old_images();
                    let body = if pairs_old {
                        json_document_with_old(&columns, &self.table.primary_key())
                    } else {
                        json_document(&[("row", "i", &columns)])
                    };
                    let _ = writeln!(sql, "        SELECT {}", body);
                    let _ = write!(sql, "{}", self.update_source(pairs_old, &comparison));
                }
            }
        }

        let _ = writeln!(sql);
        let _ = writeln!(sql, "    IF NOT EXISTS (SELECT * FROM @messages) RETURN;");
        let _ = writeln!(sql);
        let _ = writeln!(sql, "    DECLARE @handle UNIQUEIDENTIFIER;");
        let _ = writeln!(sql, "    DECLARE @body NVARCHAR(MAX);");
        let _ = writeln!(sql, "    BEGIN DIALOG CONVERSATION @handle");
        let _ = writeln!(sql, "        FROM SERVICE {}", quote_identifier(&service));
        let _ = writeln!(sql, "        TO SERVICE {}", quote_literal(&service));
        let _ = writeln!(sql, "        ON CONTRACT {}", quote_identifier(&contract));
        let _ = writeln!(sql, "        WITH ENCRYPTION = OFF;");
        let _ = writeln!(sql);
        let _ = writeln!(
            sql,
            "    DECLARE message_cursor CURSOR LOCAL FAST_FORWARD FOR SELECT [body] FROM @messages ORDER BY [seq];"
        );
        let _ = writeln!(sql, "    OPEN message_cursor;");
        let _ = writeln!(sql, "    FETCH NEXT FROM message_cursor INTO @body;");
        let _ = writeln!(sql, "    WHILE @@FETCH_STATUS = 0");
        let _ = writeln!(sql, "    BEGIN");
        for change in &changes {
            let _ = writeln!(
                sql,
                "        IF @dmlType = N'{}' SEND ON CONVERSATION @handle MESSAGE TYPE {} (CAST(@body AS VARBINARY(MAX)));",
                change,
                quote_identifier(&token.message_type(*change))
            );
        }
        let _ = writeln!(sql, "        FETCH NEXT FROM message_cursor INTO @body;");
        let _ = writeln!(sql, "    END");
        let _ = writeln!(sql, "    CLOSE message_cursor;");
        let _ = writeln!(sql, "    DEALLOCATE message_cursor;");
        let _ = writeln!(sql);
        let _ = writeln!(sql, "    END CONVERSATION @handle;");
        let _ = write!(sql, "END");

        sql
    }

    /// Old images need a key to be paired with their new image
    fn pairs_old_images(&self) -> bool {
        self.include_old_values && !self.table.primary_key().is_empty()
    }

    /// FROM/WHERE clause selecting the updated rows to report.
    ///
    /// A new image is reported when its comparison tuple is absent from the
    /// whole `deleted` set; old images are joined on the key only when requested.
    fn update_source(&self, pairs_old: bool, comparison: &[String]) -> String {
        let mut sql = String::new();
        let _ = writeln!(sql, "        FROM inserted AS i");

        if pairs_old {
            let on = self
                .table
                .primary_key()
                .iter()
                .map(|c| {
                    let col = quote_identifier(&c.name);
                    format!("i.{col} = d.{col}")
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            let _ = writeln!(sql, "        LEFT JOIN deleted AS d ON {}", on);
        }

        if comparison.is_empty() {
            // nothing comparable: every updated row is reported
            sql.truncate(sql.trim_end().len());
            sql.push_str(";\n");
            return sql;
        }

        let new_values = comparison
            .iter()
            .map(|c| format!("i.{}", quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let old_values = comparison
            .iter()
            .map(|c| format!("{}.{}", PREVIOUS_ALIAS, quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            sql,
            "        WHERE EXISTS (SELECT {} EXCEPT SELECT {} FROM deleted AS {});",
            new_values, old_values, PREVIOUS_ALIAS
        );
        sql
    }

    /// Teardown DDL in dependency order; every drop is guarded by an
    /// existence check so the sequence is idempotent.
    pub fn teardown_statements(naming: &NamingConvention, schema: &str) -> Vec<DdlStatement> {
        let trigger = naming.compose(ObjectRole::Trigger);
        let service = naming.compose(ObjectRole::Service);
        let queue = naming.compose(ObjectRole::Queue);
        let contract = naming.compose(ObjectRole::Contract);

        let mut statements = vec![
            DdlStatement {
                action: DdlAction::Drop,
                sql: format!(
                    "IF OBJECT_ID({}, N'TR') IS NOT NULL DROP TRIGGER {};",
                    quote_literal(&quote_qualified(schema, &trigger)),
                    quote_qualified(schema, &trigger)
                ),
                object: ProvisionedObject::new(ObjectKind::Trigger, trigger),
            },
            DdlStatement {
                action: DdlAction::Drop,
                sql: end_conversations_sql(&service),
                object: ProvisionedObject::new(ObjectKind::ConversationEndpoints, service.clone()),
            },
            DdlStatement {
                action: DdlAction::Drop,
                sql: format!(
                    "IF EXISTS (SELECT * FROM sys.services WHERE name = {}) DROP SERVICE {};",
                    quote_literal(&service),
                    quote_identifier(&service)
                ),
                object: ProvisionedObject::new(ObjectKind::Service, service),
            },
            DdlStatement {
                action: DdlAction::Drop,
                sql: format!(
                    "IF EXISTS (SELECT * FROM sys.service_queues q INNER JOIN sys.schemas s ON q.schema_id = s.schema_id WHERE q.name = {} AND s.name = {}) DROP QUEUE {};",
                    quote_literal(&queue),
                    quote_literal(schema),
                    quote_qualified(schema, &queue)
                ),
                object: ProvisionedObject::new(ObjectKind::Queue, queue),
            },
            DdlStatement {
                action: DdlAction::Drop,
                sql: format!(
                    "IF EXISTS (SELECT * FROM sys.service_contracts WHERE name = {}) DROP CONTRACT {};",
                    quote_literal(&contract),
                    quote_identifier(&contract)
                ),
                object: ProvisionedObject::new(ObjectKind::Contract, contract),
            },
        ];

        for change in ChangeType::ALL {
            let name = naming.message_type(change);
            statements.push(DdlStatement {
                action: DdlAction::Drop,
                sql: format!(
                    "IF EXISTS (SELECT * FROM sys.service_message_types WHERE name = {}) DROP MESSAGE TYPE {};",
                    quote_literal(&name),
                    quote_identifier(&name)
                ),
                object: ProvisionedObject::new(ObjectKind::MessageType, name),
            });
        }

        statements
    }

    /// Create every object; on failure, drop whatever was created.
    pub async fn provision(&self, session: &mut dyn SqlSession) -> Result<()> {
        info!(
            "Provisioning objects '{}' on {}",
            self.naming,
            self.table.qualified_name()
        );

        for statement in self.create_statements() {
            debug!("Creating {}", statement.object);
            if let Err(e) = session.execute_ddl(&statement).await {
                error!("Failed to create {}: {}", statement.object, e);
                let report = Self::teardown(session, &self.naming, &self.table.schema).await;
                if !report.is_clean() {
                    warn!(
                        "Rollback of '{}' left {} object(s) behind",
                        self.naming,
                        report.failures.len()
                    );
                }
                return Err(match e {
                    TableWatchError::Query(msg) => TableWatchError::query(format!(
                        "creating {} failed: {}",
                        statement.object, msg
                    )),
                    other => other,
                });
            }
        }

        info!("Provisioned objects '{}'", self.naming);
        Ok(())
    }

    /// Best-effort teardown: every statement is attempted and failures are
    /// collected instead of aborting.
    pub async fn teardown(
        session: &mut dyn SqlSession,
        naming: &NamingConvention,
        schema: &str,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();

        for statement in Self::teardown_statements(naming, schema) {
            match session.execute_ddl(&statement).await {
                Ok(()) => report.executed += 1,
                Err(e) => {
                    warn!("Failed to drop {}: {}", statement.object, e);
                    report.failures.push((statement.object, e.to_string()));
                }
            }
        }

        if report.is_clean() {
            info!("Dropped objects '{}'", naming);
        }
        report
    }

    /// Objects of a subscription still present (cleanup check)
    pub async fn remaining_objects(
        session: &mut dyn SqlSession,
        naming: &NamingConvention,
        schema: &str,
    ) -> Result<Vec<ProvisionedObject>> {
        session.remaining_objects(naming, schema).await
    }
}

/// `(SELECT JSON_QUERY(...) AS [row], ... FOR JSON PATH, WITHOUT_ARRAY_WRAPPER)`
fn json_document(parts: &[(&str, &str, &[&ColumnDescriptor])]) -> String {
    let members = parts
        .iter()
        .map(|(key, alias, columns)| {
            format!(
                "JSON_QUERY({}) AS {}",
                json_object(alias, columns),
                quote_identifier(key)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("(SELECT {} FOR JSON PATH, WITHOUT_ARRAY_WRAPPER)", members)
}

/// Update document whose `old` member is present only when a row with the
/// same key was deleted by the statement
fn json_document_with_old(columns: &[&ColumnDescriptor], key: &[&ColumnDescriptor]) -> String {
    let matched = key
        .iter()
        .map(|c| format!("d.{} IS NOT NULL", quote_identifier(&c.name)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "(SELECT JSON_QUERY({}) AS [row], JSON_QUERY(CASE WHEN {} THEN {} END) AS [old] FOR JSON PATH, WITHOUT_ARRAY_WRAPPER)",
        json_object("i", columns),
        matched,
        json_object("d", columns)
    )
}

/// Row image object; NULL columns are omitted by FOR JSON
fn json_object(alias: &str, columns: &[&ColumnDescriptor]) -> String {
    if columns.is_empty() {
        return "N'{}'".to_string();
    }
    let projection = columns
        .iter()
        .map(|c| {
            let source = format!("{}.{}", alias, quote_identifier(&c.name));
            let value = if c.is_exact_numeric() {
                format!("CONVERT(NVARCHAR(64), {})", source)
            } else {
                source
            };
            format!("{} AS {}", value, quote_identifier(&c.name))
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("(SELECT {} FOR JSON PATH, WITHOUT_ARRAY_WRAPPER)", projection)
}

/// Ends every conversation that still references a service
fn end_conversations_sql(service: &str) -> String {
    let service = quote_literal(service);
    format!(
        "DECLARE @handle UNIQUEIDENTIFIER;
DECLARE endpoint_cursor CURSOR LOCAL FAST_FORWARD FOR
    SELECT ce.conversation_handle FROM sys.conversation_endpoints ce
    LEFT JOIN sys.services s ON ce.service_id = s.service_id
    WHERE ce.far_service = {service} OR s.name = {service};
OPEN endpoint_cursor;
FETCH NEXT FROM endpoint_cursor INTO @handle;
WHILE @@FETCH_STATUS = 0
BEGIN
    END CONVERSATION @handle WITH CLEANUP;
    FETCH NEXT FROM endpoint_cursor INTO @handle;
END
CLOSE endpoint_cursor;
DEALLOCATE endpoint_cursor;",
        service = service
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ModelToTableMapper;
    use crate::model::{FieldKind, ModelField};
    use crate::schema::ColumnDescriptor;

    fn table(with_pk: bool) -> TableDescriptor {
        let id = ColumnDescriptor::new("Id", "int");
        let id = if with_pk { id.primary_key(1) } else { id };
        TableDescriptor::new(
            "dbo",
            "Items",
            vec![
                id,
                ColumnDescriptor::new("Name", "nvarchar"),
                ColumnDescriptor::new("Price", "decimal").with_precision(18, 4),
                ColumnDescriptor::new("Memo", "nvarchar"),
                ColumnDescriptor::new("Legacy", "ntext"),
            ],
        )
    }

    fn provisioner(
        with_pk: bool,
        interest: InterestSet,
        filter: DmlTriggerFilter,
    ) -> ObjectProvisioner {
        let table = table(with_pk);
        let fields = vec![
            ModelField::new("id", FieldKind::I32),
            ModelField::new("name", FieldKind::String),
            ModelField::new("price", FieldKind::Decimal),
        ];
        let mapping = ModelToTableMapper::new()
            .resolve_fields(&fields, false, "Item", &table)
            .unwrap();
        ObjectProvisioner::new(
            NamingConvention::adopt("Items_abc").unwrap(),
            table,
            mapping,
            interest,
            filter,
        )
    }

    #[test]
    fn test_create_order() {
        let p = provisioner(true, InterestSet::All, DmlTriggerFilter::all());
        let kinds: Vec<_> = p.create_statements().iter().map(|s| s.object.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::MessageType,
                ObjectKind::MessageType,
                ObjectKind::MessageType,
                ObjectKind::Contract,
                ObjectKind::Queue,
                ObjectKind::Service,
                ObjectKind::Trigger,
            ]
        );

        let statements = p.create_statements();
        assert_eq!(
            statements[0].sql,
            "CREATE MESSAGE TYPE [Items_abc/Insert] VALIDATION = NONE;"
        );
        assert!(statements[3]
            .sql
            .contains("[Items_abc/Update] SENT BY INITIATOR"));
        assert!(statements[4].sql.starts_with("CREATE QUEUE [dbo].[Items_abc]"));
        assert_eq!(
            statements[5].sql,
            "CREATE SERVICE [Items_abc] ON QUEUE [dbo].[Items_abc] ([Items_abc]);"
        );
    }

    #[test]
    fn test_filter_limits_message_types() {
        let p = provisioner(true, InterestSet::All, DmlTriggerFilter::INSERT);
        let message_types: Vec<_> = p
            .objects()
            .into_iter()
            .filter(|o| o.kind == ObjectKind::MessageType)
            .map(|o| o.name)
            .collect();
        assert_eq!(message_types, vec!["Items_abc/Insert"]);

        let trigger = p.trigger_sql();
        assert!(trigger.contains("IF @dmlType = N'Insert'"));
        assert!(!trigger.contains("IF @dmlType = N'Update'"));
        assert!(!trigger.contains("FROM deleted AS d;"));
    }

    #[test]
    fn test_trigger_projects_mapped_columns_per_row() {
        let p = provisioner(true, InterestSet::All, DmlTriggerFilter::all());
        let trigger = p.trigger_sql();

        assert!(trigger.starts_with("CREATE TRIGGER [dbo].[tr_Items_abc_Sender] ON [dbo].[Items]"));
        assert!(trigger.contains("FROM inserted AS i;"));
        assert!(trigger.contains("FROM deleted AS d;"));
        assert!(trigger.contains("CONVERT(NVARCHAR(64), i.[Price]) AS [Price]"));
        assert!(trigger.contains("i.[Name] AS [Name]"));
        // unmapped and untransportable columns never reach the payload
        assert!(!trigger.contains("[Memo]"));
        assert!(!trigger.contains("[Legacy]"));
        assert!(trigger.contains("WHILE @@FETCH_STATUS = 0"));
        assert!(trigger.contains(
            "IF @dmlType = N'Delete' SEND ON CONVERSATION @handle MESSAGE TYPE [Items_abc/Delete]"
        ));
        assert!(trigger.contains("END CONVERSATION @handle;"));
    }

    #[test]
    fn test_update_compares_values() {
        let p = provisioner(
            true,
            InterestSet::Columns(vec!["Name".to_string()]),
            DmlTriggerFilter::all(),
        );
        let trigger = p.trigger_sql();
        assert!(trigger.contains(
            "        FROM inserted AS i\n        WHERE EXISTS (SELECT i.[Name] EXCEPT SELECT prev.[Name] FROM deleted AS prev);"
        ));
        assert!(!trigger.contains("JOIN deleted"));
        assert!(!trigger.contains("AS [old]"));
    }

    #[test]
    fn test_default_interest_compares_mapped_columns() {
        let p = provisioner(true, InterestSet::All, DmlTriggerFilter::all());
        let trigger = p.trigger_sql();
        assert!(trigger.contains(
            "WHERE EXISTS (SELECT i.[Id], i.[Name], i.[Price] EXCEPT SELECT prev.[Id], prev.[Name], prev.[Price] FROM deleted AS prev);"
        ));
    }

    #[test]
    fn test_old_values_and_interest_payload() {
        let p = provisioner(
            true,
            InterestSet::Columns(vec!["Name".to_string()]),
            DmlTriggerFilter::UPDATE,
        )
        .include_old_values(true)
        .payload_scope(PayloadScope::InterestColumns);
        let trigger = p.trigger_sql();
        assert!(trigger.contains(
            "(SELECT JSON_QUERY((SELECT i.[Name] AS [Name] FOR JSON PATH, WITHOUT_ARRAY_WRAPPER)) AS [row], JSON_QUERY(CASE WHEN d.[Id] IS NOT NULL THEN (SELECT d.[Name] AS [Name] FOR JSON PATH, WITHOUT_ARRAY_WRAPPER) END) AS [old] FOR JSON PATH, WITHOUT_ARRAY_WRAPPER)"
        ));
        assert!(trigger.contains("        LEFT JOIN deleted AS d ON i.[Id] = d.[Id]\n"));
    }

    #[test]
    fn test_update_detects_key_changes_without_join() {
        // UPDATE Items SET Id = Id + 100 leaves no inserted row with a matching
        // deleted key, so the comparison must not depend on a key join
        let p = provisioner(true, InterestSet::All, DmlTriggerFilter::UPDATE);
        let trigger = p.trigger_sql();
        assert!(!trigger.contains("INNER JOIN"));
        assert!(!trigger.contains("JOIN deleted"));
        assert!(trigger.contains(
            "EXCEPT SELECT prev.[Id], prev.[Name], prev.[Price] FROM deleted AS prev"
        ));
    }

    #[test]
    fn test_update_without_primary_key_compares_sets() {
        let p = provisioner(false, InterestSet::All, DmlTriggerFilter::UPDATE)
            .include_old_values(true);
        let trigger = p.trigger_sql();
        assert!(!trigger.contains("ROW_NUMBER()"));
        assert!(!trigger.contains("JOIN deleted"));
        // no key to pair old images with
        assert!(!trigger.contains("AS [old]"));
        assert!(trigger.contains(
            "        FROM inserted AS i\n        WHERE EXISTS (SELECT i.[Id], i.[Name], i.[Price] EXCEPT SELECT prev.[Id], prev.[Name], prev.[Price] FROM deleted AS prev);"
        ));
        assert!(!trigger.contains("SELECT *,"));
        assert!(!trigger.contains("[Legacy]"));
    }

    #[test]
    fn test_teardown_order_and_idempotence() {
        let naming = NamingConvention::adopt("Items_abc").unwrap();
        let statements = ObjectProvisioner::teardown_statements(&naming, "dbo");
        let kinds: Vec<_> = statements.iter().map(|s| s.object.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::Trigger,
                ObjectKind::ConversationEndpoints,
                ObjectKind::Service,
                ObjectKind::Queue,
                ObjectKind::Contract,
                ObjectKind::MessageType,
                ObjectKind::MessageType,
                ObjectKind::MessageType,
            ]
        );
        assert!(statements.iter().all(|s| s.action == DdlAction::Drop));
        assert!(statements
            .iter()
            .filter(|s| s.object.kind != ObjectKind::ConversationEndpoints)
            .all(|s| s.sql.starts_with("IF ")));
        assert_eq!(
            statements[0].sql,
            "IF OBJECT_ID(N'[dbo].[tr_Items_abc_Sender]', N'TR') IS NOT NULL DROP TRIGGER [dbo].[tr_Items_abc_Sender];"
        );
        assert!(statements[1].sql.contains("END CONVERSATION @handle WITH CLEANUP;"));
    }
}
