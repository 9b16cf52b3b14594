//! Receive loop
//!
//! One listener task per subscription owns one session and blocks on
//! `WAITFOR (RECEIVE ...)` with a bounded timeout. Cancellation is only
//! observed between receives so a message already taken off the queue is
//! always dispatched.

use crate::decoder::{change_type_of, RecordDecoder};
use crate::error::{Result, TableWatchError};
use crate::event::ChangeEvent;
use crate::model::TableModel;
use crate::naming::{NamingConvention, ObjectRole};
use crate::provisioner::ObjectProvisioner;
use crate::session::{BrokerMessage, SqlSession, END_DIALOG_MESSAGE_TYPE, ERROR_MESSAGE_TYPE};
use crate::status::{StatusCell, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive non-fatal receive failures tolerated before the loop gives up
pub const MAX_CONSECUTIVE_RECEIVE_FAILURES: u32 = 3;

/// Callback receiving decoded changes
pub type ChangeHandler<T> = Arc<dyn Fn(ChangeEvent<T>) + Send + Sync>;

/// Callback receiving runtime errors
pub type ErrorHandler = Arc<dyn Fn(&TableWatchError) + Send + Sync>;

/// Application callbacks, fixed at build time
pub struct Handlers<T> {
    pub on_changed: Option<ChangeHandler<T>>,
    pub on_error: Option<ErrorHandler>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self {
            on_changed: None,
            on_error: None,
        }
    }
}

impl<T> Handlers<T> {
    pub(crate) fn report(&self, error: &TableWatchError) {
        if let Some(handler) = &self.on_error {
            if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                warn!("Error callback panicked while reporting: {}", error);
            }
        }
    }
}

/// Receive and idle timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerTimeouts {
    /// Upper bound of one `WAITFOR (RECEIVE)`
    pub receive_timeout: Duration,
    /// Inactivity after which the objects are dropped
    pub idle_teardown: Duration,
}

impl Default for ListenerTimeouts {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(5),
            idle_teardown: Duration::from_secs(180),
        }
    }
}

impl ListenerTimeouts {
    pub fn new(receive_timeout: Duration, idle_teardown: Duration) -> Self {
        Self {
            receive_timeout,
            idle_teardown,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.receive_timeout.is_zero() {
            return Err(TableWatchError::config("receive timeout must be greater than 0"));
        }
        if self.receive_timeout.as_millis() > i32::MAX as u128 {
            return Err(TableWatchError::config("receive timeout is too large"));
        }
        if self.idle_teardown.is_zero() {
            return Err(TableWatchError::config("idle teardown must be greater than 0"));
        }
        Ok(())
    }
}

/// Listener counters
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    messages_received: AtomicU64,
    events_dispatched: AtomicU64,
    decode_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    system_messages: AtomicU64,
    receive_failures: AtomicU64,
    idle_teardowns: AtomicU64,
}

impl ListenerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics snapshot
    pub fn snapshot(&self) -> ListenerMetricsSnapshot {
        ListenerMetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            system_messages: self.system_messages.load(Ordering::Relaxed),
            receive_failures: self.receive_failures.load(Ordering::Relaxed),
            idle_teardowns: self.idle_teardowns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ListenerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerMetricsSnapshot {
    pub messages_received: u64,
    pub events_dispatched: u64,
    pub decode_failures: u64,
    pub dispatch_failures: u64,
    pub system_messages: u64,
    pub receive_failures: u64,
    pub idle_teardowns: u64,
}

/// State shared between a subscription and its listener task
pub(crate) struct ListenerContext<T> {
    pub naming: NamingConvention,
    pub schema: String,
    pub decoder: Arc<RecordDecoder>,
    pub handlers: Arc<Handlers<T>>,
    pub status: Arc<StatusCell>,
    pub metrics: Arc<ListenerMetrics>,
    /// Cleared once the objects are dropped
    pub provisioned: Arc<AtomicBool>,
    /// Whether inactivity drops the objects
    pub idle_teardown_enabled: bool,
}

impl<T> Clone for ListenerContext<T> {
    fn clone(&self) -> Self {
        Self {
            naming: self.naming.clone(),
            schema: self.schema.clone(),
            decoder: self.decoder.clone(),
            handlers: self.handlers.clone(),
            status: self.status.clone(),
            metrics: self.metrics.clone(),
            provisioned: self.provisioned.clone(),
            idle_teardown_enabled: self.idle_teardown_enabled,
        }
    }
}

/// The receive loop of one subscription
pub(crate) struct ChangeListener<T> {
    session: Box<dyn SqlSession>,
    context: ListenerContext<T>,
    timeouts: ListenerTimeouts,
    cancel: CancellationToken,
    queue: String,
}

impl<T: TableModel> ChangeListener<T> {
    pub fn new(
        session: Box<dyn SqlSession>,
        context: ListenerContext<T>,
        timeouts: ListenerTimeouts,
        cancel: CancellationToken,
    ) -> Self {
        let queue = context.naming.compose(ObjectRole::Queue);
        Self {
            session,
            context,
            timeouts,
            cancel,
            queue,
        }
    }

    /// Run until cancelled or a fatal error. The session is handed back
    /// after a cancellation so it can be reused.
    pub async fn run(mut self) -> Option<Box<dyn SqlSession>> {
        let status = self.context.status.clone();
        status.set(SubscriptionStatus::WaitingForNotification);
        info!(
            "Listening on queue [{}].[{}] (receive timeout {:?}, idle teardown {:?})",
            self.context.schema, self.queue, self.timeouts.receive_timeout, self.timeouts.idle_teardown
        );

        let mut last_activity = Instant::now();
        let mut consecutive_failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if !self.context.provisioned.load(Ordering::Acquire) {
                // objects are gone; nothing left to receive until stopped
                self.cancel.cancelled().await;
                break;
            }

            let received = self
                .session
                .receive(&self.context.schema, &self.queue, self.timeouts.receive_timeout)
                .await;

            match received {
                Ok(None) => {
                    consecutive_failures = 0;
                    if self.context.idle_teardown_enabled
                        && last_activity.elapsed() >= self.timeouts.idle_teardown
                    {
                        self.idle_teardown().await;
                    }
                }
                Ok(Some(message)) => {
                    consecutive_failures = 0;
                    last_activity = Instant::now();
                    ListenerMetrics::bump(&self.context.metrics.messages_received);

                    if let Err(e) = self.handle(message).await {
                        self.fail(e);
                        return None;
                    }
                }
                Err(e) => {
                    ListenerMetrics::bump(&self.context.metrics.receive_failures);
                    if e.is_fatal() {
                        self.fail(e);
                        return None;
                    }

                    consecutive_failures += 1;
                    warn!(
                        "Receive on [{}] failed ({}/{}): {}",
                        self.queue, consecutive_failures, MAX_CONSECUTIVE_RECEIVE_FAILURES, e
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_RECEIVE_FAILURES {
                        self.fail(e);
                        return None;
                    }

                    let backoff = Duration::from_millis(250 * u64::from(consecutive_failures));
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!("Listener for '{}' cancelled", self.context.naming);
        status.set(SubscriptionStatus::StoppedDueToCancellation);
        Some(self.session)
    }

    /// Process one message; only fatal errors are returned
    async fn handle(&mut self, message: BrokerMessage) -> Result<()> {
        let status = self.context.status.clone();

        match message.message_type.as_str() {
            END_DIALOG_MESSAGE_TYPE => {
                ListenerMetrics::bump(&self.context.metrics.system_messages);
                self.end_conversation(&message).await
            }
            ERROR_MESSAGE_TYPE => {
                ListenerMetrics::bump(&self.context.metrics.system_messages);
                self.end_conversation(&message).await?;
                let error = TableWatchError::query(format!(
                    "conversation {} ended with error: {}",
                    message.conversation_handle,
                    message.body.as_deref().unwrap_or("")
                ));
                warn!("{}", error);
                self.context.handlers.report(&error);
                Ok(())
            }
            message_type => {
                let Some(change_type) = change_type_of(&self.context.naming, message_type) else {
                    ListenerMetrics::bump(&self.context.metrics.system_messages);
                    debug!("Ignoring message of type '{}'", message_type);
                    return Ok(());
                };

                status.set(SubscriptionStatus::MessageReadyToBeNotified);

                let decoded = match message.body.as_deref() {
                    Some(body) => self.context.decoder.decode::<T>(change_type, body),
                    None => Err(TableWatchError::decode("message has no body")),
                };

                match decoded {
                    Ok(event) => {
                        status.set(SubscriptionStatus::NotificationConsuming);
                        self.dispatch(event);
                        status.set(SubscriptionStatus::NotificationConsumed);
                    }
                    Err(e) => {
                        ListenerMetrics::bump(&self.context.metrics.decode_failures);
                        warn!("Skipping {} message: {}", change_type, e);
                        self.context.handlers.report(&e);
                    }
                }

                status.set(SubscriptionStatus::WaitingForNotification);
                Ok(())
            }
        }
    }

    fn dispatch(&self, event: ChangeEvent<T>) {
        let Some(handler) = &self.context.handlers.on_changed else {
            ListenerMetrics::bump(&self.context.metrics.events_dispatched);
            return;
        };

        let change_type = event.change_type;
        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(()) => ListenerMetrics::bump(&self.context.metrics.events_dispatched),
            Err(panic) => {
                ListenerMetrics::bump(&self.context.metrics.dispatch_failures);
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let error = TableWatchError::Dispatch(format!(
                    "change callback panicked on {}: {}",
                    change_type, reason
                ));
                error!("{}", error);
                self.context.handlers.report(&error);
            }
        }
    }

    async fn end_conversation(&mut self, message: &BrokerMessage) -> Result<()> {
        match self.session.end_conversation(message.conversation_handle).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    "Failed to end conversation {}: {}",
                    message.conversation_handle, e
                );
                Ok(())
            }
        }
    }

    async fn idle_teardown(&mut self) {
        info!(
            "No activity on '{}' for {:?}, dropping objects",
            self.context.naming, self.timeouts.idle_teardown
        );
        let report = ObjectProvisioner::teardown(
            self.session.as_mut(),
            &self.context.naming,
            &self.context.schema,
        )
        .await;
        if !report.is_clean() {
            warn!(
                "Idle teardown of '{}' left {} object(s) behind",
                self.context.naming,
                report.failures.len()
            );
        }
        self.context.provisioned.store(false, Ordering::Release);
        ListenerMetrics::bump(&self.context.metrics.idle_teardowns);
    }

    fn fail(&self, error: TableWatchError) {
        error!("Listener for '{}' stopped: {}", self.context.naming, error);
        self.context.handlers.report(&error);
        self.context.status.set(SubscriptionStatus::StoppedDueToError);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = ListenerTimeouts::default();
        assert_eq!(timeouts.receive_timeout, Duration::from_secs(5));
        assert_eq!(timeouts.idle_teardown, Duration::from_secs(180));
        assert!(timeouts.validate().is_ok());
    }

    #[test]
    fn test_timeouts_validation() {
        assert!(ListenerTimeouts::new(Duration::ZERO, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(ListenerTimeouts::new(Duration::from_secs(1), Duration::ZERO)
            .validate()
            .is_err());
        // idle teardown shorter than the receive timeout is allowed
        assert!(
            ListenerTimeouts::new(Duration::from_secs(10), Duration::from_secs(1))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = ListenerMetrics::new();
        ListenerMetrics::bump(&metrics.messages_received);
        ListenerMetrics::bump(&metrics.messages_received);
        ListenerMetrics::bump(&metrics.decode_failures);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.events_dispatched, 0);
    }
}
