//! In-process database used by tests and demos
//!
//! [`MemoryServer`] keeps the catalog of provisioned objects and one queue per
//! subscription, and emulates the trigger through [`MemoryServer::fire`]: a
//! firing delivers only while both the trigger and the service exist, exactly
//! as the real trigger returns early once the service is gone.

use super::{BrokerMessage, SessionFactory, SqlSession, END_DIALOG_MESSAGE_TYPE};
use crate::error::{Result, TableWatchError};
use crate::event::ChangeType;
use crate::naming::{NamingConvention, ObjectRole};
use crate::provisioner::{DdlAction, DdlStatement, ObjectKind, ProvisionedObject};
use crate::schema::TableDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    database: String,
    broker_disabled: bool,
    denied_permissions: Vec<String>,
    tables: Vec<TableDescriptor>,
    objects: Vec<ProvisionedObject>,
    queues: HashMap<String, VecDeque<BrokerMessage>>,
    /// Open conversation handle -> owning service
    conversations: HashMap<Uuid, String>,
    statements: Vec<DdlStatement>,
    fail_create: Option<ObjectKind>,
    fail_drop: Option<ObjectKind>,
    connection_lost: bool,
    failing_receives: usize,
    connections: usize,
}

struct Inner {
    state: Mutex<State>,
    arrivals: Notify,
}

/// Shared in-memory database
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<Inner>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// Create an empty database with Service Broker enabled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    database: "memory".to_string(),
                    ..Default::default()
                }),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Factory opening sessions against this server
    pub fn factory(&self) -> MemorySessionFactory {
        MemorySessionFactory {
            server: self.clone(),
        }
    }

    /// Add or replace a table
    pub fn register_table(&self, table: TableDescriptor) {
        let mut state = self.inner.state.lock();
        state
            .tables
            .retain(|t| !(t.schema.eq_ignore_ascii_case(&table.schema) && t.name.eq_ignore_ascii_case(&table.name)));
        state.tables.push(table);
    }

    /// Toggle Service Broker on the database
    pub fn set_broker_enabled(&self, enabled: bool) {
        self.inner.state.lock().broker_disabled = !enabled;
    }

    /// Report a permission as missing
    pub fn deny_permission(&self, permission: impl Into<String>) {
        self.inner.state.lock().denied_permissions.push(permission.into());
    }

    /// Make every create of this kind fail
    pub fn fail_create(&self, kind: Option<ObjectKind>) {
        self.inner.state.lock().fail_create = kind;
    }

    /// Make every drop of this kind fail
    pub fn fail_drop(&self, kind: Option<ObjectKind>) {
        self.inner.state.lock().fail_drop = kind;
    }

    /// Simulate connection loss: connects and receives fail until restored
    pub fn set_connection_lost(&self, lost: bool) {
        self.inner.state.lock().connection_lost = lost;
        self.inner.arrivals.notify_waiters();
    }

    /// Make the next `count` receives fail with a query error
    pub fn fail_receives(&self, count: usize) {
        self.inner.state.lock().failing_receives = count;
        self.inner.arrivals.notify_waiters();
    }

    /// Emulate one trigger firing: every body becomes one message on a
    /// single conversation, which the initiator then ends.
    ///
    /// Returns `false` when nothing was delivered because the trigger, the
    /// service or the message type is missing.
    pub fn fire(&self, token: &str, change: ChangeType, bodies: Vec<Value>) -> bool {
        let Ok(naming) = NamingConvention::adopt(token) else {
            return false;
        };
        let mut state = self.inner.state.lock();

        let exists = |state: &State, kind: ObjectKind, name: &str| {
            state.objects.iter().any(|o| o.kind == kind && o.name == name)
        };
        let service = naming.compose(ObjectRole::Service);
        if !exists(&*state, ObjectKind::Trigger, &naming.compose(ObjectRole::Trigger))
            || !exists(&*state, ObjectKind::Service, &service)
            || !exists(&*state, ObjectKind::MessageType, &naming.message_type(change))
        {
            return false;
        }
        if bodies.is_empty() {
            return true;
        }

        let handle = Uuid::new_v4();
        let queue_name = naming.compose(ObjectRole::Queue);
        let Some(queue) = state.queues.get_mut(&queue_name) else {
            return false;
        };
        for body in bodies {
            queue.push_back(BrokerMessage {
                conversation_handle: handle,
                message_type: naming.message_type(change),
                body: Some(body.to_string()),
            });
        }
        queue.push_back(BrokerMessage {
            conversation_handle: handle,
            message_type: END_DIALOG_MESSAGE_TYPE.to_string(),
            body: None,
        });
        state.conversations.insert(handle, service);
        drop(state);

        self.inner.arrivals.notify_waiters();
        true
    }

    /// Put an arbitrary message on a subscription's queue
    pub fn enqueue(&self, token: &str, message_type: &str, body: Option<String>) -> bool {
        let mut state = self.inner.state.lock();
        let Some(queue) = state.queues.get_mut(token) else {
            return false;
        };
        let handle = Uuid::new_v4();
        queue.push_back(BrokerMessage {
            conversation_handle: handle,
            message_type: message_type.to_string(),
            body,
        });
        state.conversations.insert(handle, token.to_string());
        drop(state);

        self.inner.arrivals.notify_waiters();
        true
    }

    /// Current catalog of subscription objects
    pub fn objects(&self) -> Vec<ProvisionedObject> {
        self.inner.state.lock().objects.clone()
    }

    /// Whether any object or open conversation of a subscription remains
    pub fn has_objects(&self, token: &str) -> bool {
        let Ok(naming) = NamingConvention::adopt(token) else {
            return false;
        };
        !remaining(&self.inner.state.lock(), &naming).is_empty()
    }

    /// Messages waiting on a subscription's queue
    pub fn pending_messages(&self, token: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(token)
            .map_or(0, VecDeque::len)
    }

    /// Conversations not yet ended
    pub fn open_conversations(&self) -> usize {
        self.inner.state.lock().conversations.len()
    }

    /// Every DDL statement executed so far
    pub fn executed_statements(&self) -> Vec<DdlStatement> {
        self.inner.state.lock().statements.clone()
    }

    /// Sessions opened so far
    pub fn connections(&self) -> usize {
        self.inner.state.lock().connections
    }
}

fn remaining(state: &State, naming: &NamingConvention) -> Vec<ProvisionedObject> {
    let owned: Vec<String> = ChangeType::ALL
        .iter()
        .map(|c| naming.message_type(*c))
        .chain([
            naming.compose(ObjectRole::Contract),
            naming.compose(ObjectRole::Trigger),
        ])
        .collect();

    let mut objects: Vec<ProvisionedObject> = state
        .objects
        .iter()
        .filter(|o| owned.contains(&o.name) || o.name == naming.token())
        .cloned()
        .collect();

    let service = naming.compose(ObjectRole::Service);
    if state.conversations.values().any(|s| *s == service) {
        objects.push(ProvisionedObject::new(
            ObjectKind::ConversationEndpoints,
            service,
        ));
    }
    objects
}

/// Session over a [`MemoryServer`]
pub struct MemorySession {
    server: MemoryServer,
}

impl MemorySession {
    fn check_connection(&self) -> Result<()> {
        if self.server.inner.state.lock().connection_lost {
            return Err(TableWatchError::connection("connection to memory server lost"));
        }
        Ok(())
    }
}

#[async_trait]
impl SqlSession for MemorySession {
    async fn database_name(&mut self) -> Result<String> {
        self.check_connection()?;
        Ok(self.server.inner.state.lock().database.clone())
    }

    async fn verify_service_broker(&mut self) -> Result<()> {
        self.check_connection()?;
        let state = self.server.inner.state.lock();
        if state.broker_disabled {
            return Err(TableWatchError::ServiceBrokerNotEnabled(state.database.clone()));
        }
        Ok(())
    }

    async fn missing_permissions(&mut self, _schema: &str) -> Result<Vec<String>> {
        self.check_connection()?;
        Ok(self.server.inner.state.lock().denied_permissions.clone())
    }

    async fn describe_table(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Option<TableDescriptor>> {
        self.check_connection()?;
        Ok(self
            .server
            .inner
            .state
            .lock()
            .tables
            .iter()
            .find(|t| t.schema.eq_ignore_ascii_case(schema) && t.name.eq_ignore_ascii_case(table))
            .cloned())
    }

    async fn execute_ddl(&mut self, statement: &DdlStatement) -> Result<()> {
        self.check_connection()?;
        let mut state = self.server.inner.state.lock();
        let object = &statement.object;

        match statement.action {
            DdlAction::Create => {
                if state.fail_create == Some(object.kind) {
                    return Err(TableWatchError::query(format!(
                        "CREATE {} '{}' rejected",
                        object.kind, object.name
                    )));
                }
                if state.objects.contains(object) {
                    return Err(TableWatchError::query(format!(
                        "There is already an object named '{}' in the database",
                        object.name
                    )));
                }
                if object.kind == ObjectKind::Queue {
                    state.queues.insert(object.name.clone(), VecDeque::new());
                }
                state.objects.push(object.clone());
            }
            DdlAction::Drop => {
                if state.fail_drop == Some(object.kind) {
                    return Err(TableWatchError::query(format!(
                        "DROP {} '{}' rejected",
                        object.kind, object.name
                    )));
                }
                match object.kind {
                    ObjectKind::ConversationEndpoints => {
                        state.conversations.retain(|_, service| *service != object.name);
                    }
                    ObjectKind::Queue => {
                        state.queues.remove(&object.name);
                        state.objects.retain(|o| o != object);
                    }
                    _ => state.objects.retain(|o| o != object),
                }
            }
        }

        debug!("memory: {:?} {}", statement.action, object);
        state.statements.push(statement.clone());
        Ok(())
    }

    async fn receive(
        &mut self,
        _schema: &str,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<BrokerMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let arrival = self.server.inner.arrivals.notified();
            {
                let mut state = self.server.inner.state.lock();
                if state.connection_lost {
                    return Err(TableWatchError::connection("connection to memory server lost"));
                }
                if state.failing_receives > 0 {
                    state.failing_receives -= 1;
                    return Err(TableWatchError::query("RECEIVE failed"));
                }
                let Some(messages) = state.queues.get_mut(queue) else {
                    return Err(TableWatchError::query(format!(
                        "Invalid object name '{}'",
                        queue
                    )));
                };
                if let Some(message) = messages.pop_front() {
                    return Ok(Some(message));
                }
            }

            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn end_conversation(&mut self, handle: Uuid) -> Result<()> {
        self.check_connection()?;
        self.server.inner.state.lock().conversations.remove(&handle);
        Ok(())
    }

    async fn remaining_objects(
        &mut self,
        naming: &NamingConvention,
        _schema: &str,
    ) -> Result<Vec<ProvisionedObject>> {
        self.check_connection()?;
        Ok(remaining(&self.server.inner.state.lock(), naming))
    }
}

/// Opens [`MemorySession`]s
#[derive(Clone)]
pub struct MemorySessionFactory {
    server: MemoryServer,
}

impl MemorySessionFactory {
    pub fn new(server: MemoryServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn connect(&self) -> Result<Box<dyn SqlSession>> {
        let mut state = self.server.inner.state.lock();
        if state.connection_lost {
            return Err(TableWatchError::connection("memory server unreachable"));
        }
        state.connections += 1;
        Ok(Box::new(MemorySession {
            server: self.server.clone(),
        }))
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::ObjectProvisioner;
    use serde_json::json;

    fn provisioned(server: &MemoryServer, token: &str) {
        let mut state = server.inner.state.lock();
        let naming = NamingConvention::adopt(token).unwrap();
        for change in ChangeType::ALL {
            state
                .objects
                .push(ProvisionedObject::new(ObjectKind::MessageType, naming.message_type(change)));
        }
        for (kind, role) in [
            (ObjectKind::Contract, ObjectRole::Contract),
            (ObjectKind::Queue, ObjectRole::Queue),
            (ObjectKind::Service, ObjectRole::Service),
            (ObjectKind::Trigger, ObjectRole::Trigger),
        ] {
            state
                .objects
                .push(ProvisionedObject::new(kind, naming.compose(role)));
        }
        state.queues.insert(token.to_string(), VecDeque::new());
    }

    #[tokio::test]
    async fn test_fire_and_receive() {
        let server = MemoryServer::new();
        provisioned(&server, "t1");
        let mut session = server.factory().connect().await.unwrap();

        assert!(server.fire("t1", ChangeType::Insert, vec![json!({"row": {"Id": 1}})]));
        let message = session
            .receive("dbo", "t1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.message_type, "t1/Insert");

        let end = session
            .receive("dbo", "t1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.message_type, END_DIALOG_MESSAGE_TYPE);
        assert_eq!(end.conversation_handle, message.conversation_handle);

        session.end_conversation(end.conversation_handle).await.unwrap();
        assert_eq!(server.open_conversations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out() {
        let server = MemoryServer::new();
        provisioned(&server, "t1");
        let mut session = server.factory().connect().await.unwrap();
        let received = session
            .receive("dbo", "t1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_teardown_silences_trigger() {
        let server = MemoryServer::new();
        provisioned(&server, "t1");
        let mut session = server.factory().connect().await.unwrap();

        let naming = NamingConvention::adopt("t1").unwrap();
        let report = ObjectProvisioner::teardown(session.as_mut(), &naming, "dbo").await;
        assert!(report.is_clean());
        assert!(!server.has_objects("t1"));
        assert!(!server.fire("t1", ChangeType::Insert, vec![json!({})]));

        let err = session
            .receive("dbo", "t1", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TableWatchError::Query(_)));
    }

    #[tokio::test]
    async fn test_connection_loss() {
        let server = MemoryServer::new();
        server.set_connection_lost(true);
        assert!(server.factory().connect().await.is_err());
        server.set_connection_lost(false);
        assert!(server.factory().connect().await.is_ok());
        assert_eq!(server.connections(), 1);
    }
}
