//! Notification routing to registered listeners.
//!
//! This module provides the `NotificationRouter`, which maps topics
//! (resource ids, event names) to the listeners interested in them and fans
//! out unsolicited device messages.
//!
//! The router holds only weak references: a listener lives as long as its
//! owner keeps it, and dead entries are pruned on the next dispatch.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Error type listeners may return from [`NotificationListener::on_notification`]
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of device notifications
pub trait NotificationListener: Send + Sync {
    /// Handle one notification. Errors are logged by the router and never
    /// affect other listeners.
    fn on_notification(&self, topic: &str, payload: &Value) -> Result<(), ListenerError>;
}

/// Outcome of one [`NotificationRouter::dispatch`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that handled the notification
    pub delivered: usize,
    /// Listeners that returned an error or panicked
    pub failed: usize,
}

type ListenerRef = Weak<dyn NotificationListener>;

fn same_listener(entry: &ListenerRef, listener: &Arc<dyn NotificationListener>) -> bool {
    // Compare data addresses only; vtable pointers for the same type may differ
    std::ptr::eq(
        entry.as_ptr() as *const (),
        Arc::as_ptr(listener) as *const (),
    )
}

/// Routes notifications by topic
#[derive(Default)]
pub struct NotificationRouter {
    topics: RwLock<HashMap<String, Vec<ListenerRef>>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `topic`.
    ///
    /// Returns `false` if the pair was already registered; registering twice
    /// is a no-op.
    pub fn subscribe(&self, topic: impl Into<String>, listener: &Arc<dyn NotificationListener>) -> bool {
        let topic = topic.into();
        let mut topics = self.topics.write();
        let entries = topics.entry(topic.clone()).or_default();
        if entries.iter().any(|entry| same_listener(entry, listener)) {
            tracing::trace!("Listener already subscribed to {}", topic);
            return false;
        }
        entries.push(Arc::downgrade(listener));
        tracing::debug!("Subscribed listener to {} ({} total)", topic, entries.len());
        true
    }

    /// Remove `listener` from `topic`. Returns whether it was registered.
    pub fn unsubscribe(&self, topic: &str, listener: &Arc<dyn NotificationListener>) -> bool {
        let mut topics = self.topics.write();
        let Some(entries) = topics.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| !same_listener(entry, listener));
        let removed = entries.len() != before;
        if entries.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Remove `listener` from every topic. Returns the number of removed subscriptions.
    pub fn unsubscribe_all(&self, listener: &Arc<dyn NotificationListener>) -> usize {
        let mut topics = self.topics.write();
        let mut removed = 0;
        topics.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| !same_listener(entry, listener));
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Deliver a notification to every live listener of `topic`, in
    /// registration order.
    ///
    /// The listener list is snapshotted first, so listeners may subscribe or
    /// unsubscribe (themselves included) from inside the callback.
    pub fn dispatch(&self, topic: &str, payload: &Value) -> DispatchReport {
        let snapshot: Vec<ListenerRef> = match self.topics.read().get(topic) {
            Some(entries) => entries.clone(),
            None => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        let mut saw_dead = false;

        for entry in snapshot {
            let Some(listener) = entry.upgrade() else {
                saw_dead = true;
                continue;
            };

            match catch_unwind(AssertUnwindSafe(|| listener.on_notification(topic, payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!("Listener for {} failed: {}", topic, e);
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!("Listener for {} panicked", topic);
                }
            }
        }

        if saw_dead {
            self.prune(topic);
        }
        report
    }

    /// Number of live listeners for `topic`
    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|entries| entries.iter().filter(|e| e.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Topics with at least one registration
    pub fn topics(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }

    fn prune(&self, topic: &str) {
        let mut topics = self.topics.write();
        if let Some(entries) = topics.get_mut(topic) {
            entries.retain(|entry| entry.strong_count() > 0);
            if entries.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("topics", &self.topics.read().len())
            .finish()
    }
}
