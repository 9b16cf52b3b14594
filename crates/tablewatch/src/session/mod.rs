//! Database session abstraction
//!
//! Everything the engine needs from the database goes through [`SqlSession`]:
//! catalog checks, DDL execution, the blocking queue receive, and the cleanup
//! check. [`SessionFactory`] opens sessions; the listener owns one for its whole
//! lifetime while provisioning and teardown open short-lived ones.

mod memory;

pub use memory::{MemoryServer, MemorySession, MemorySessionFactory};

use crate::error::{Result, TableWatchError};
use crate::naming::NamingConvention;
use crate::provisioner::{DdlStatement, ProvisionedObject};
use crate::schema::TableDescriptor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Service Broker message type that closes a conversation
pub const END_DIALOG_MESSAGE_TYPE: &str = "http://schemas.microsoft.com/SQL/ServiceBroker/EndDialog";

/// Service Broker message type carrying a conversation error
pub const ERROR_MESSAGE_TYPE: &str = "http://schemas.microsoft.com/SQL/ServiceBroker/Error";

/// A message taken off a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Conversation the message belongs to
    pub conversation_handle: Uuid,
    /// Message type name
    pub message_type: String,
    /// Body decoded as text
    pub body: Option<String>,
}

/// Session against the database hosting the watched table
#[async_trait]
pub trait SqlSession: Send {
    /// Name of the current database
    async fn database_name(&mut self) -> Result<String>;

    /// Fail with `ServiceBrokerNotEnabled` unless the broker is active
    async fn verify_service_broker(&mut self) -> Result<()>;

    /// Permissions required for provisioning that the login lacks
    async fn missing_permissions(&mut self, schema: &str) -> Result<Vec<String>>;

    /// Table metadata, `None` when the table does not exist
    async fn describe_table(&mut self, schema: &str, table: &str)
        -> Result<Option<TableDescriptor>>;

    /// Execute one DDL statement as its own batch
    async fn execute_ddl(&mut self, statement: &DdlStatement) -> Result<()>;

    /// Block up to `timeout` for the next message on a queue
    async fn receive(
        &mut self,
        schema: &str,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<BrokerMessage>>;

    /// End the local side of a conversation
    async fn end_conversation(&mut self, handle: Uuid) -> Result<()>;

    /// Objects of a subscription still present in the database
    async fn remaining_objects(
        &mut self,
        naming: &NamingConvention,
        schema: &str,
    ) -> Result<Vec<ProvisionedObject>>;
}

/// Opens sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a new session
    async fn connect(&self) -> Result<Box<dyn SqlSession>>;

    /// Target description safe for logs
    fn target(&self) -> String;
}

/// Open a session with exponential backoff
pub async fn connect_with_retry(
    factory: &Arc<dyn SessionFactory>,
    max_retries: u32,
) -> Result<Box<dyn SqlSession>> {
    let mut last_error = None;
    let mut delay = Duration::from_millis(500);

    for attempt in 1..=max_retries {
        match factory.connect().await {
            Ok(session) => return Ok(session),
            Err(e) => {
                warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    attempt,
                    max_retries,
                    factory.target(),
                    e
                );
                last_error = Some(e);

                if attempt < max_retries {
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| TableWatchError::connection("Max retries exceeded")))
}
