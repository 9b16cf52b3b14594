//! Subscription lifecycle
//!
//! ```rust,ignore
//! use tablewatch::{ChangeType, Subscription};
//!
//! let mut subscription = Subscription::<Customer>::builder(conn_str)
//!     .table("Customers")
//!     .update_of(["Name"])
//!     .on_changed(|event| println!("{} {:?}", event.change_type, event.entity))
//!     .on_error(|e| eprintln!("{}", e))
//!     .build()
//!     .await?;
//!
//! subscription.start().await?;
//! // ...
//! subscription.dispose().await?;
//! ```
//!
//! `build()` performs every validation (connection, broker, permissions,
//! table, mapping, update-of list) before any object exists. `start()`
//! provisions the objects and spawns the listener; `stop()` and `dispose()`
//! drop them according to the [`TeardownPolicy`].

use crate::config::{ConnectionString, SubscriptionOptions, TeardownPolicy};
use crate::decoder::{Culture, RecordDecoder};
use crate::error::{Result, TableWatchError};
use crate::event::ChangeEvent;
use crate::interest::{validate_filter, DmlTriggerFilter, InterestSet};
use crate::listener::{
    ChangeListener, Handlers, ListenerContext, ListenerMetrics, ListenerMetricsSnapshot,
    ListenerTimeouts,
};
use crate::mapper::{ColumnMapping, ModelToTableMapper};
use crate::model::TableModel;
use crate::naming::NamingConvention;
use crate::provisioner::{DdlStatement, ObjectKind, ObjectProvisioner, PayloadScope};
use crate::schema::{SchemaIntrospector, TableDescriptor};
use crate::session::{connect_with_retry, SessionFactory, SqlSession};
use crate::sqlserver::SqlServerSessionFactory;
use crate::status::{StatusCell, StatusHandler, SubscriptionStatus};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum ConnectionSource {
    ConnectionString(String),
    Factory(Arc<dyn SessionFactory>),
}

/// Builder for [`Subscription`]
pub struct SubscriptionBuilder<T: TableModel> {
    source: ConnectionSource,
    options: SubscriptionOptions,
    mapper: ModelToTableMapper,
    handlers: Handlers<T>,
    on_status_changed: Option<StatusHandler>,
    _model: PhantomData<fn() -> T>,
}

impl<T: TableModel> SubscriptionBuilder<T> {
    fn new(source: ConnectionSource) -> Self {
        Self {
            source,
            options: SubscriptionOptions::default(),
            mapper: ModelToTableMapper::new(),
            handlers: Handlers::default(),
            on_status_changed: None,
            _model: PhantomData,
        }
    }

    /// Table to watch (default: the model's table name)
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.options.table = Some(table.into());
        self
    }

    /// Schema of the table (default: dbo)
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.options.schema = schema.into();
        self
    }

    /// Explicit field-to-column mappings
    pub fn mapper(mut self, mapper: ModelToTableMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Only notify updates that change one of these columns
    pub fn update_of<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.update_of = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Carry the previous image on updates as `ChangeEvent::old_entity`
    pub fn include_old_values(mut self, include: bool) -> Self {
        self.options.include_old_values = include;
        self
    }

    /// DML operations that produce notifications (default: all)
    pub fn notify_on(mut self, filter: DmlTriggerFilter) -> Self {
        self.options.notify_on = filter;
        self
    }

    /// Reattach to objects created earlier under this token
    pub fn naming_convention(mut self, token: impl Into<String>) -> Self {
        self.options.naming_convention = Some(token.into());
        self
    }

    /// `true` drops the objects on `stop()`, `false` only on `dispose()`
    pub fn teardown(mut self, on_stop: bool) -> Self {
        self.options.teardown = if on_stop {
            TeardownPolicy::OnStop
        } else {
            TeardownPolicy::OnDispose
        };
        self
    }

    /// Never drop the objects, so another process can reattach
    pub fn keep_for_reattach(mut self) -> Self {
        self.options.teardown = TeardownPolicy::Never;
        self
    }

    /// Parse text columns with this culture
    pub fn culture(mut self, culture: Culture) -> Self {
        self.options.culture = Some(culture);
        self
    }

    /// Columns carried by Update payloads
    pub fn payload_scope(mut self, scope: PayloadScope) -> Self {
        self.options.payload_scope = scope;
        self
    }

    /// Upper bound of one receive (default: 5s)
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeouts.receive_timeout = timeout;
        self
    }

    /// Inactivity before the objects are dropped (default: 180s)
    pub fn idle_teardown(mut self, timeout: Duration) -> Self {
        self.options.timeouts.idle_teardown = timeout;
        self
    }

    /// Connection attempts for provisioning, listening and teardown
    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.options.connect_retries = retries;
        self
    }

    /// Replace every option at once
    pub fn options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    /// Open sessions through this factory instead of the connection string
    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.source = ConnectionSource::Factory(factory);
        self
    }

    /// Called on the listener task for every decoded change
    pub fn on_changed<F>(mut self, handler: F) -> Self
    where
        F: Fn(ChangeEvent<T>) + Send + Sync + 'static,
    {
        self.handlers.on_changed = Some(Arc::new(handler));
        self
    }

    /// Called for decode, dispatch and fatal listener errors
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TableWatchError) + Send + Sync + 'static,
    {
        self.handlers.on_error = Some(Arc::new(handler));
        self
    }

    /// Called on every status transition
    pub fn on_status_changed<F>(mut self, handler: F) -> Self
    where
        F: Fn(SubscriptionStatus) + Send + Sync + 'static,
    {
        self.on_status_changed = Some(Arc::new(handler));
        self
    }

    /// Validate everything and return a subscription ready to start.
    ///
    /// Nothing is created in the database here.
    pub async fn build(self) -> Result<Subscription<T>> {
        let options = self.options;
        options.validate()?;

        let table_name = options.table.clone().unwrap_or_else(T::table_name);
        let naming = match &options.naming_convention {
            Some(token) => NamingConvention::adopt(token.as_str())?,
            None => NamingConvention::generate(&table_name),
        };

        let factory: Arc<dyn SessionFactory> = match self.source {
            ConnectionSource::ConnectionString(raw) => {
                Arc::new(SqlServerSessionFactory::new(ConnectionString::parse(&raw)?))
            }
            ConnectionSource::Factory(factory) => factory,
        };

        let mut session = factory.connect().await.map_err(|e| match e {
            TableWatchError::InvalidConnectionString(_) => e,
            other => TableWatchError::InvalidConnectionString(format!(
                "cannot connect to {}: {}",
                factory.target(),
                other
            )),
        })?;

        session.verify_service_broker().await?;

        // adopted objects already exist, so no CREATE rights are needed
        if !naming.is_adopted() {
            let missing = session.missing_permissions(&options.schema).await?;
            if !missing.is_empty() {
                return Err(TableWatchError::UserWithNoPermission(missing));
            }
        }

        let table = SchemaIntrospector::describe(session.as_mut(), &options.schema, &table_name).await?;
        let mapping = self.mapper.resolve::<T>(&table)?;
        let interest = InterestSet::build(options.update_of.as_deref(), &table)?;
        validate_filter(&interest, options.notify_on)?;
        if options.include_old_values && table.primary_key().is_empty() {
            warn!(
                "{} has no primary key; update events will carry no old values",
                table.qualified_name()
            );
        }

        let provisioner = ObjectProvisioner::new(
            naming.clone(),
            table.clone(),
            mapping.clone(),
            interest,
            options.notify_on,
        )
        .include_old_values(options.include_old_values)
        .payload_scope(options.payload_scope);

        let decoder = RecordDecoder::new(mapping, table.clone()).with_culture(options.culture.clone());

        info!(
            "Subscription '{}' on {} ready ({} mapped columns, teardown {:?})",
            naming,
            table.qualified_name(),
            decoder.mapping().len(),
            options.teardown
        );

        let context = ListenerContext {
            naming: naming.clone(),
            schema: options.schema.clone(),
            decoder: Arc::new(decoder),
            handlers: Arc::new(self.handlers),
            status: Arc::new(StatusCell::new(self.on_status_changed)),
            metrics: ListenerMetrics::new(),
            provisioned: Arc::new(AtomicBool::new(false)),
            idle_teardown_enabled: options.teardown != TeardownPolicy::Never,
        };

        Ok(Subscription {
            factory,
            options,
            naming,
            table,
            provisioner,
            context,
            session: Some(session),
            running: None,
            disposed: false,
        })
    }
}

struct RunningListener {
    cancel: CancellationToken,
    handle: JoinHandle<Option<Box<dyn SqlSession>>>,
}

/// A live change subscription on one table
pub struct Subscription<T: TableModel> {
    factory: Arc<dyn SessionFactory>,
    options: SubscriptionOptions,
    naming: NamingConvention,
    table: TableDescriptor,
    provisioner: ObjectProvisioner,
    context: ListenerContext<T>,
    /// Idle session reused by the next start or teardown
    session: Option<Box<dyn SqlSession>>,
    running: Option<RunningListener>,
    disposed: bool,
}

impl<T: TableModel> Subscription<T> {
    /// Builder connecting with an ADO.NET connection string
    pub fn builder(connection_string: impl Into<String>) -> SubscriptionBuilder<T> {
        SubscriptionBuilder::new(ConnectionSource::ConnectionString(connection_string.into()))
    }

    /// Builder opening sessions through a factory
    pub fn with_factory(factory: Arc<dyn SessionFactory>) -> SubscriptionBuilder<T> {
        SubscriptionBuilder::new(ConnectionSource::Factory(factory))
    }

    /// Start with the configured timeouts
    pub async fn start(&mut self) -> Result<()> {
        self.start_with(self.options.timeouts).await
    }

    /// Provision (unless the objects exist) and spawn the listener.
    ///
    /// Calling it while the listener runs is a no-op.
    pub async fn start_with(&mut self, timeouts: ListenerTimeouts) -> Result<()> {
        timeouts.validate()?;

        if let Some(running) = &self.running {
            if !running.handle.is_finished() {
                debug!("Subscription '{}' already running", self.naming);
                return Ok(());
            }
        }
        self.halt().await;

        let status = self.context.status.clone();
        status.set(SubscriptionStatus::Starting);

        let session = match self.prepare().await {
            Ok(session) => session,
            Err(e) => {
                status.set(SubscriptionStatus::StoppedDueToError);
                return Err(e);
            }
        };

        status.set(SubscriptionStatus::Started);

        let cancel = CancellationToken::new();
        let listener = ChangeListener::new(session, self.context.clone(), timeouts, cancel.clone());
        let handle = tokio::spawn(listener.run());
        self.running = Some(RunningListener { cancel, handle });

        info!("Subscription '{}' started", self.naming);
        Ok(())
    }

    /// Session for the listener, with the objects in place
    async fn prepare(&mut self) -> Result<Box<dyn SqlSession>> {
        let mut session = self.take_session().await?;

        if !self.context.provisioned.load(Ordering::Acquire) {
            if self.naming.is_adopted() {
                self.attach_or_provision(session.as_mut()).await?;
            } else {
                self.provisioner.provision(session.as_mut()).await?;
            }
            self.context.provisioned.store(true, Ordering::Release);
        }

        Ok(session)
    }

    /// Reuse complete existing objects, otherwise recreate them
    async fn attach_or_provision(&self, session: &mut dyn SqlSession) -> Result<()> {
        let existing =
            ObjectProvisioner::remaining_objects(session, &self.naming, &self.options.schema).await?;
        let has = |kind: ObjectKind| existing.iter().any(|o| o.kind == kind);

        if has(ObjectKind::Queue) && has(ObjectKind::Service) && has(ObjectKind::Trigger) {
            info!("Attaching to existing objects '{}'", self.naming);
            return Ok(());
        }

        if !existing.is_empty() {
            warn!(
                "Objects '{}' are incomplete ({} found), recreating",
                self.naming,
                existing.len()
            );
            ObjectProvisioner::teardown(session, &self.naming, &self.options.schema).await;
        }
        self.provisioner.provision(session).await
    }

    async fn take_session(&mut self) -> Result<Box<dyn SqlSession>> {
        match self.session.take() {
            Some(session) => Ok(session),
            None => connect_with_retry(&self.factory, self.options.connect_retries).await,
        }
    }

    /// Cancel the listener and wait for it to finish its current receive
    async fn halt(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        match running.handle.await {
            Ok(Some(session)) => self.session = Some(session),
            Ok(None) => {}
            Err(e) => warn!("Listener task for '{}' failed: {}", self.naming, e),
        }
    }

    /// Drop the objects; failures are logged
    async fn teardown(&mut self) {
        if !self.context.provisioned.load(Ordering::Acquire) {
            debug!("Objects '{}' already dropped", self.naming);
            return;
        }

        match self.take_session().await {
            Ok(mut session) => {
                let report =
                    ObjectProvisioner::teardown(session.as_mut(), &self.naming, &self.options.schema)
                        .await;
                if !report.is_clean() {
                    for (object, error) in &report.failures {
                        warn!("Could not drop {}: {}", object, error);
                    }
                }
                self.session = Some(session);
            }
            Err(e) => warn!(
                "Cannot connect to drop objects '{}': {}. Run cleanup with this naming convention",
                self.naming, e
            ),
        }
        self.context.provisioned.store(false, Ordering::Release);
    }

    /// Stop the listener; drops the objects under [`TeardownPolicy::OnStop`]
    pub async fn stop(&mut self) -> Result<()> {
        self.halt().await;
        if self.options.teardown.on_stop() {
            self.teardown().await;
        }
        info!("Subscription '{}' stopped", self.naming);
        Ok(())
    }

    /// Stop the listener and keep the objects; queued changes are delivered
    /// by the next `start()`
    pub async fn stop_without_disposing(&mut self) -> Result<()> {
        self.halt().await;
        info!("Subscription '{}' stopped, objects kept", self.naming);
        Ok(())
    }

    /// Stop and drop the objects unless [`TeardownPolicy::Never`]
    pub async fn dispose(mut self) -> Result<()> {
        self.halt().await;
        if self.options.teardown.on_dispose() {
            self.teardown().await;
        }
        self.disposed = true;
        info!("Subscription '{}' disposed", self.naming);
        Ok(())
    }

    pub fn naming_convention(&self) -> &NamingConvention {
        &self.naming
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.context.status.get()
    }

    /// Receiver observing every status transition
    pub fn status_receiver(&self) -> watch::Receiver<SubscriptionStatus> {
        self.context.status.subscribe()
    }

    pub fn metrics(&self) -> ListenerMetricsSnapshot {
        self.context.metrics.snapshot()
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    pub fn mapping(&self) -> &ColumnMapping {
        self.context.decoder.mapping()
    }

    pub fn teardown_policy(&self) -> TeardownPolicy {
        self.options.teardown
    }

    /// Whether the objects are believed to exist
    pub fn is_provisioned(&self) -> bool {
        self.context.provisioned.load(Ordering::Acquire)
    }

    /// DDL `start()` would execute
    pub fn provisioning_script(&self) -> Vec<DdlStatement> {
        self.provisioner.create_statements()
    }
}

impl<T: TableModel> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }

        if self.disposed
            || !self.options.teardown.on_dispose()
            || !self.context.provisioned.load(Ordering::Acquire)
        {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Subscription '{}' dropped without dispose(); objects remain",
                self.naming
            );
            return;
        };

        warn!(
            "Subscription '{}' dropped without dispose(); dropping objects in the background",
            self.naming
        );
        let factory = self.factory.clone();
        let naming = self.naming.clone();
        let schema = self.options.schema.clone();
        let retries = self.options.connect_retries;
        let running = self.running.take();
        let session = self.session.take();
        runtime.spawn(async move {
            // let the listener leave its receive before the queue goes away
            if let Some(running) = running {
                let _ = running.handle.await;
            }
            let session = match session {
                Some(session) => Ok(session),
                None => connect_with_retry(&factory, retries).await,
            };
            match session {
                Ok(mut session) => {
                    ObjectProvisioner::teardown(session.as_mut(), &naming, &schema).await;
                }
                Err(e) => warn!("Cannot drop objects '{}': {}", naming, e),
            }
        });
    }
}
