//! TDS session backed by Tiberius

use super::error::SqlServerError;
use crate::config::ConnectionString;
use crate::error::{Result, TableWatchError};
use crate::naming::{NamingConvention, ObjectRole};
use crate::provisioner::{DdlStatement, ObjectKind, ProvisionedObject};
use crate::schema::{ColumnDescriptor, TableDescriptor};
use crate::session::{BrokerMessage, SessionFactory, SqlSession};
use crate::event::ChangeType;
use crate::validation::quote_qualified;
use async_trait::async_trait;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, trace};
use uuid::Uuid;

const DESCRIBE_TABLE_SQL: &str = r#"
    SELECT
        c.name,
        TYPE_NAME(c.system_type_id) AS type_name,
        c.is_nullable,
        c.max_length,
        c.precision,
        c.scale,
        c.is_computed,
        ic.key_ordinal
    FROM sys.columns c
    INNER JOIN sys.tables t ON c.object_id = t.object_id
    INNER JOIN sys.schemas s ON t.schema_id = s.schema_id
    LEFT JOIN sys.indexes i ON i.object_id = t.object_id AND i.is_primary_key = 1
    LEFT JOIN sys.index_columns ic
        ON ic.object_id = i.object_id AND ic.index_id = i.index_id AND ic.column_id = c.column_id
    WHERE s.name = @P1 AND t.name = @P2
    ORDER BY c.column_id
"#;

const MISSING_PERMISSIONS_SQL: &str = r#"
    SELECT
        HAS_PERMS_BY_NAME(DB_NAME(), 'DATABASE', 'CREATE MESSAGE TYPE'),
        HAS_PERMS_BY_NAME(DB_NAME(), 'DATABASE', 'CREATE CONTRACT'),
        HAS_PERMS_BY_NAME(DB_NAME(), 'DATABASE', 'CREATE QUEUE'),
        HAS_PERMS_BY_NAME(DB_NAME(), 'DATABASE', 'CREATE SERVICE'),
        HAS_PERMS_BY_NAME(@P1, 'SCHEMA', 'ALTER')
"#;

const REQUIRED_PERMISSIONS: [&str; 5] = [
    "CREATE MESSAGE TYPE",
    "CREATE CONTRACT",
    "CREATE QUEUE",
    "CREATE SERVICE",
    "ALTER ON SCHEMA",
];

const REMAINING_OBJECTS_SQL: &str = r#"
    SELECT N'MessageType', name FROM sys.service_message_types WHERE name IN (@P1, @P2, @P3)
    UNION ALL
    SELECT N'Contract', name FROM sys.service_contracts WHERE name = @P4
    UNION ALL
    SELECT N'Queue', q.name FROM sys.service_queues q
        INNER JOIN sys.schemas s ON q.schema_id = s.schema_id
        WHERE q.name = @P4 AND s.name = @P5
    UNION ALL
    SELECT N'Service', name FROM sys.services WHERE name = @P4
    UNION ALL
    SELECT N'Trigger', t.name FROM sys.triggers t
        INNER JOIN sys.objects o ON t.object_id = o.object_id
        INNER JOIN sys.schemas s ON o.schema_id = s.schema_id
        WHERE t.name = @P6 AND s.name = @P5
    UNION ALL
    SELECT N'ConversationEndpoints', @P4 WHERE EXISTS (
        SELECT 1 FROM sys.conversation_endpoints ce
        LEFT JOIN sys.services sv ON ce.service_id = sv.service_id
        WHERE ce.far_service = @P4 OR sv.name = @P4)
"#;

/// Session over one TDS connection
pub struct SqlServerSession {
    client: Client<Compat<TcpStream>>,
    database: String,
}

impl SqlServerSession {
    /// Connect to SQL Server
    pub async fn connect(conn: &ConnectionString) -> Result<Self> {
        debug!("Connecting to SQL Server {}", conn.target());

        let mut config = Config::new();
        config.host(&conn.host);
        config.port(conn.port);
        if let Some(instance) = &conn.instance {
            config.instance_name(instance);
        }
        config.database(&conn.database);
        config.application_name(&conn.application_name);

        let password = conn
            .password
            .as_deref()
            .ok_or_else(|| TableWatchError::InvalidConnectionString(
                "Password is required for SQL Server authentication".to_string(),
            ))?;
        config.authentication(AuthMethod::sql_server(&conn.username, password));

        if conn.encrypt {
            config.encryption(EncryptionLevel::Required);
            if conn.trust_server_certificate {
                config.trust_cert();
            }
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        let connect = async {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| SqlServerError::Connection(e.to_string()))?;
            tcp.set_nodelay(true)
                .map_err(|e| SqlServerError::Connection(e.to_string()))?;
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(SqlServerError::from)
        };

        let client = tokio::time::timeout(conn.connect_timeout, connect)
            .await
            .map_err(|_| SqlServerError::ConnectTimeout(conn.target()))??;

        info!("Connected to SQL Server {}", conn.target());

        Ok(Self {
            client,
            database: conn.database.clone(),
        })
    }

    async fn query_rows(
        &mut self,
        sql: &str,
        params: &[&dyn tiberius::ToSql],
    ) -> Result<Vec<Row>> {
        let rows = self
            .client
            .query(sql, params)
            .await
            .map_err(SqlServerError::from)?
            .into_first_result()
            .await
            .map_err(SqlServerError::from)?;
        Ok(rows)
    }
}

fn column_from_row(row: &Row) -> Result<ColumnDescriptor> {
    let name: &str = row
        .get(0)
        .ok_or_else(|| SqlServerError::UnexpectedResult("column name is NULL".to_string()))?;
    let type_name: &str = row.get(1).unwrap_or("sql_variant");

    let mut column = ColumnDescriptor::new(name, type_name);
    column.nullable = row.get::<bool, _>(2).unwrap_or(true);
    column.max_length = row.get::<i16, _>(3).map(i32::from);
    column.precision = row.get::<u8, _>(4).filter(|p| *p > 0);
    column.scale = row.get::<u8, _>(5);
    column.is_computed = row.get::<bool, _>(6).unwrap_or(false);
    column.primary_key_ordinal = row.get::<u8, _>(7);
    Ok(column)
}

fn object_kind(name: &str) -> Option<ObjectKind> {
    match name {
        "MessageType" => Some(ObjectKind::MessageType),
        "Contract" => Some(ObjectKind::Contract),
        "Queue" => Some(ObjectKind::Queue),
        "Service" => Some(ObjectKind::Service),
        "Trigger" => Some(ObjectKind::Trigger),
        "ConversationEndpoints" => Some(ObjectKind::ConversationEndpoints),
        _ => None,
    }
}

#[async_trait]
impl SqlSession for SqlServerSession {
    async fn database_name(&mut self) -> Result<String> {
        Ok(self.database.clone())
    }

    async fn verify_service_broker(&mut self) -> Result<()> {
        let rows = self
            .query_rows(
                "SELECT DB_NAME(), is_broker_enabled FROM sys.databases WHERE database_id = DB_ID()",
                &[],
            )
            .await?;

        let row = rows
            .first()
            .ok_or_else(|| TableWatchError::ServiceBrokerNotEnabled(self.database.clone()))?;
        if let Some(name) = row.get::<&str, _>(0) {
            self.database = name.to_string();
        }
        if !row.get::<bool, _>(1).unwrap_or(false) {
            return Err(TableWatchError::ServiceBrokerNotEnabled(self.database.clone()));
        }

        debug!("Service Broker is enabled on database '{}'", self.database);
        Ok(())
    }

    async fn missing_permissions(&mut self, schema: &str) -> Result<Vec<String>> {
        let rows = self.query_rows(MISSING_PERMISSIONS_SQL, &[&schema]).await?;
        let Some(row) = rows.first() else {
            return Ok(REQUIRED_PERMISSIONS.iter().map(|p| p.to_string()).collect());
        };

        Ok(REQUIRED_PERMISSIONS
            .iter()
            .enumerate()
            .filter(|(i, _)| row.get::<i32, _>(*i).unwrap_or(0) != 1)
            .map(|(_, p)| {
                if *p == "ALTER ON SCHEMA" {
                    format!("ALTER ON SCHEMA::{}", schema)
                } else {
                    p.to_string()
                }
            })
            .collect())
    }

    async fn describe_table(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Option<TableDescriptor>> {
        let rows = self
            .query_rows(DESCRIBE_TABLE_SQL, &[&schema, &table])
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let columns = rows.iter().map(column_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Some(TableDescriptor::new(schema, table, columns)))
    }

    async fn execute_ddl(&mut self, statement: &DdlStatement) -> Result<()> {
        trace!("Executing DDL for {}:\n{}", statement.object, statement.sql);
        self.client
            .simple_query(statement.sql.as_str())
            .await
            .map_err(SqlServerError::from)?
            .into_results()
            .await
            .map_err(SqlServerError::from)?;
        Ok(())
    }

    async fn receive(
        &mut self,
        schema: &str,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<BrokerMessage>> {
        let sql = format!(
            "WAITFOR (RECEIVE TOP(1) conversation_handle, message_type_name, \
             CAST(message_body AS NVARCHAR(MAX)) AS message_body FROM {}), TIMEOUT {};",
            quote_qualified(schema, queue),
            timeout.as_millis().min(i32::MAX as u128)
        );

        let row = self
            .client
            .simple_query(sql)
            .await
            .map_err(SqlServerError::from)?
            .into_row()
            .await
            .map_err(SqlServerError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let conversation_handle: Uuid = row.get(0).ok_or_else(|| {
            SqlServerError::UnexpectedResult("conversation_handle is NULL".to_string())
        })?;
        let message_type: &str = row.get(1).ok_or_else(|| {
            SqlServerError::UnexpectedResult("message_type_name is NULL".to_string())
        })?;
        let body = row.get::<&str, _>(2).map(str::to_string);

        Ok(Some(BrokerMessage {
            conversation_handle,
            message_type: message_type.to_string(),
            body,
        }))
    }

    async fn end_conversation(&mut self, handle: Uuid) -> Result<()> {
        self.client
            .execute("END CONVERSATION @P1;", &[&handle])
            .await
            .map_err(SqlServerError::from)?;
        Ok(())
    }

    async fn remaining_objects(
        &mut self,
        naming: &NamingConvention,
        schema: &str,
    ) -> Result<Vec<ProvisionedObject>> {
        let insert = naming.message_type(ChangeType::Insert);
        let update = naming.message_type(ChangeType::Update);
        let delete = naming.message_type(ChangeType::Delete);
        let token = naming.token();
        let trigger = naming.compose(ObjectRole::Trigger);

        let rows = self
            .query_rows(
                REMAINING_OBJECTS_SQL,
                &[&insert.as_str(), &update.as_str(), &delete.as_str(), &token, &schema, &trigger.as_str()],
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let kind = object_kind(row.get::<&str, _>(0)?)?;
                let name = row.get::<&str, _>(1)?;
                Some(ProvisionedObject::new(kind, name))
            })
            .collect())
    }
}

/// Opens [`SqlServerSession`]s for one connection string
#[derive(Debug, Clone)]
pub struct SqlServerSessionFactory {
    connection: ConnectionString,
}

impl SqlServerSessionFactory {
    pub fn new(connection: ConnectionString) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &ConnectionString {
        &self.connection
    }
}

#[async_trait]
impl SessionFactory for SqlServerSessionFactory {
    async fn connect(&self) -> Result<Box<dyn SqlSession>> {
        Ok(Box::new(SqlServerSession::connect(&self.connection).await?))
    }

    fn target(&self) -> String {
        self.connection.target()
    }
}
