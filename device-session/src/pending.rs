//! Tracking of in-flight calls awaiting a response
//!
//! The table maps a correlation id to the waiter that issued it. It is plain
//! data with `&mut self` methods: the session keeps it under the same lock as
//! the connection state so that the reader path, the timer path and
//! `disconnect()` never observe one without the other.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use session_codec::CallId;

use crate::error::CallError;

/// Final result delivered to a waiting caller
pub type CallOutcome = Result<Value, CallError>;

/// Receiving end handed to the caller by [`PendingCallTable::register`]
pub type CallWaiter = oneshot::Receiver<CallOutcome>;

/// An outstanding request awaiting its correlated response
#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    method: String,
    issued_at: Instant,
    completion: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    fn complete(self, outcome: CallOutcome) {
        // The caller may have given up already; nothing to do then
        let _ = self.completion.send(outcome);
    }
}

/// Registration failed because the id is already pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Call id {0} is already pending")]
pub struct DuplicateCallId(pub CallId);

impl From<DuplicateCallId> for CallError {
    fn from(error: DuplicateCallId) -> Self {
        CallError::DuplicateId(error.0)
    }
}

/// Outstanding calls keyed by correlation id
#[derive(Debug, Default)]
pub struct PendingCallTable {
    calls: HashMap<CallId, PendingCall>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and return the receiver its response will arrive on.
    ///
    /// A duplicate id means the id generator is broken; it is reported as an
    /// error and the existing entry is left untouched.
    pub fn register(
        &mut self,
        id: CallId,
        method: impl Into<String>,
    ) -> Result<CallWaiter, DuplicateCallId> {
        if self.calls.contains_key(&id) {
            tracing::error!("Refusing to register duplicate call id {}", id);
            return Err(DuplicateCallId(id));
        }

        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                id,
                method: method.into(),
                issued_at: Instant::now(),
                completion: tx,
            },
        );
        Ok(rx)
    }

    /// Complete the waiter for `id`. Unknown ids are late or duplicate
    /// responses and are ignored.
    pub fn resolve(&mut self, id: CallId, outcome: CallOutcome) -> bool {
        match self.calls.remove(&id) {
            Some(call) => {
                tracing::trace!(
                    "Resolved call {} ({}) after {:?}",
                    id,
                    call.method,
                    call.issued_at.elapsed()
                );
                call.complete(outcome);
                true
            }
            None => {
                tracing::debug!("Dropping response for unknown call id {}", id);
                false
            }
        }
    }

    /// Complete the waiter for `id` with a timeout and remove it
    pub fn expire(&mut self, id: CallId) -> bool {
        match self.calls.remove(&id) {
            Some(call) => {
                let timeout = call.issued_at.elapsed();
                tracing::debug!("Call {} ({}) expired after {:?}", id, call.method, timeout);
                call.complete(Err(CallError::Timeout { id, timeout }));
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id` without completing it
    pub fn remove(&mut self, id: CallId) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Complete every outstanding waiter with `error`
    pub fn cancel_all(&mut self, error: CallError) -> usize {
        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            call.complete(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!("Cancelled {} pending calls: {}", count, error);
        }
        count
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Age of the oldest outstanding call
    pub fn oldest_age(&self) -> Option<Duration> {
        self.calls.values().map(|call| call.issued_at.elapsed()).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut table = PendingCallTable::new();
        let rx = table.register(CallId::new(42), "JSONRPC.Ping").unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.resolve(CallId::new(42), Ok(json!("pong"))));
        assert_eq!(rx.await.unwrap().unwrap(), json!("pong"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut table = PendingCallTable::new();
        let _rx = table.register(CallId::new(1), "a").unwrap();
        let err = table.register(CallId::new(1), "b").unwrap_err();
        assert_eq!(err, DuplicateCallId(CallId::new(1)));
        assert_eq!(CallError::from(err), CallError::DuplicateId(CallId::new(1)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_is_noop() {
        let mut table = PendingCallTable::new();
        assert!(!table.resolve(CallId::new(99), Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_expire() {
        let mut table = PendingCallTable::new();
        let rx = table.register(CallId::new(5), "Player.GetItem").unwrap();

        assert!(table.expire(CallId::new(5)));
        assert!(!table.expire(CallId::new(5)));
        assert!(matches!(
            rx.await.unwrap(),
            Err(CallError::Timeout { id, .. }) if id == CallId::new(5)
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_late_response_after_expire_is_dropped() {
        let mut table = PendingCallTable::new();
        let rx = table.register(CallId::new(5), "m").unwrap();
        table.expire(CallId::new(5));
        assert!(!table.resolve(CallId::new(5), Ok(json!(1))));
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let mut table = PendingCallTable::new();
        let waiters: Vec<_> = (1..=3)
            .map(|i| table.register(CallId::new(i), "m").unwrap())
            .collect();

        assert_eq!(table.cancel_all(CallError::Disconnected), 3);
        assert!(table.is_empty());
        for rx in waiters {
            assert_eq!(rx.await.unwrap(), Err(CallError::Disconnected));
        }
        assert_eq!(table.cancel_all(CallError::Disconnected), 0);
    }

    #[test]
    fn test_remove_and_oldest_age() {
        let mut table = PendingCallTable::new();
        assert!(table.oldest_age().is_none());
        let _rx = table.register(CallId::new(1), "m").unwrap();
        assert!(table.oldest_age().is_some());
        assert!(table.contains(CallId::new(1)));
        assert!(table.remove(CallId::new(1)));
        assert!(!table.contains(CallId::new(1)));
    }

    #[test]
    fn test_dropped_waiter_does_not_panic() {
        let mut table = PendingCallTable::new();
        let rx = table.register(CallId::new(1), "m").unwrap();
        drop(rx);
        assert!(table.resolve(CallId::new(1), Ok(Value::Null)));
    }

    proptest! {
        #[test]
        fn prop_each_response_reaches_its_waiter(order in Just((1u64..=16).collect::<Vec<_>>()).prop_shuffle()) {
            let mut table = PendingCallTable::new();
            let mut waiters: Vec<(u64, CallWaiter)> = (1u64..=16)
                .map(|i| (i, table.register(CallId::new(i), "m").unwrap()))
                .collect();

            for id in &order {
                prop_assert!(table.resolve(CallId::new(*id), Ok(json!(*id))));
            }
            prop_assert!(table.is_empty());

            for (id, rx) in waiters.iter_mut() {
                let outcome = rx.try_recv().unwrap();
                prop_assert_eq!(outcome, Ok(json!(*id)));
            }
        }
    }
}
