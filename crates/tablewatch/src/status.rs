//! Subscription status
//!
//! The listener task is the only writer. Readers get the current value from
//! an atomic, and every transition is also pushed to a `watch` channel and to
//! the optional status callback, in that order, after the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{trace, warn};

/// Callback invoked on every status transition
pub type StatusHandler = Arc<dyn Fn(SubscriptionStatus) + Send + Sync>;

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubscriptionStatus {
    WaitingForStart = 0,
    Starting = 1,
    Started = 2,
    WaitingForNotification = 3,
    MessageReadyToBeNotified = 4,
    NotificationConsuming = 5,
    NotificationConsumed = 6,
    StoppedDueToCancellation = 7,
    StoppedDueToError = 8,
}

impl SubscriptionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::WaitingForNotification,
            4 => Self::MessageReadyToBeNotified,
            5 => Self::NotificationConsuming,
            6 => Self::NotificationConsumed,
            7 => Self::StoppedDueToCancellation,
            8 => Self::StoppedDueToError,
            _ => Self::WaitingForStart,
        }
    }

    /// Whether the listener loop is alive
    pub fn is_running(&self) -> bool {
        !matches!(
            self,
            Self::WaitingForStart | Self::StoppedDueToCancellation | Self::StoppedDueToError
        )
    }

    /// Whether the listener loop has ended
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::StoppedDueToCancellation | Self::StoppedDueToError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingForStart => "waiting_for_start",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::WaitingForNotification => "waiting_for_notification",
            Self::MessageReadyToBeNotified => "message_ready_to_be_notified",
            Self::NotificationConsuming => "notification_consuming",
            Self::NotificationConsumed => "notification_consumed",
            Self::StoppedDueToCancellation => "stopped_due_to_cancellation",
            Self::StoppedDueToError => "stopped_due_to_error",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared status with change publication
pub struct StatusCell {
    value: AtomicU8,
    sender: watch::Sender<SubscriptionStatus>,
    handler: Option<StatusHandler>,
}

impl StatusCell {
    pub fn new(handler: Option<StatusHandler>) -> Self {
        let (sender, _) = watch::channel(SubscriptionStatus::WaitingForStart);
        Self {
            value: AtomicU8::new(SubscriptionStatus::WaitingForStart as u8),
            sender,
            handler,
        }
    }

    /// Current status
    pub fn get(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Store and publish a transition
    pub fn set(&self, status: SubscriptionStatus) {
        self.value.store(status as u8, Ordering::Release);
        self.sender.send_replace(status);
        trace!("Status -> {}", status);

        if let Some(handler) = &self.handler {
            if catch_unwind(AssertUnwindSafe(|| handler(status))).is_err() {
                warn!("Status callback panicked on {}", status);
            }
        }
    }

    /// Receiver observing every published status
    pub fn subscribe(&self) -> watch::Receiver<SubscriptionStatus> {
        self.sender.subscribe()
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCell")
            .field("value", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_round_trip_through_atomic() {
        let cell = StatusCell::new(None);
        assert_eq!(cell.get(), SubscriptionStatus::WaitingForStart);
        for status in [
            SubscriptionStatus::Starting,
            SubscriptionStatus::NotificationConsumed,
            SubscriptionStatus::StoppedDueToError,
        ] {
            cell.set(status);
            assert_eq!(cell.get(), status);
        }
    }

    #[test]
    fn test_transitions_published() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cell = StatusCell::new(Some(Arc::new(move |s| sink.lock().push(s))));
        let rx = cell.subscribe();

        cell.set(SubscriptionStatus::Starting);
        cell.set(SubscriptionStatus::Started);

        assert_eq!(
            *seen.lock(),
            vec![SubscriptionStatus::Starting, SubscriptionStatus::Started]
        );
        assert_eq!(*rx.borrow(), SubscriptionStatus::Started);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let cell = StatusCell::new(Some(Arc::new(|_| panic!("boom"))));
        cell.set(SubscriptionStatus::Starting);
        assert_eq!(cell.get(), SubscriptionStatus::Starting);
    }

    #[test]
    fn test_running_predicates() {
        assert!(SubscriptionStatus::WaitingForNotification.is_running());
        assert!(!SubscriptionStatus::WaitingForStart.is_running());
        assert!(SubscriptionStatus::StoppedDueToError.is_stopped());
    }
}
