//! Session counters

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the session's tasks
#[derive(Debug, Default)]
pub(crate) struct SessionStats {
    pub calls_sent: AtomicU64,
    pub calls_succeeded: AtomicU64,
    pub calls_failed: AtomicU64,
    pub calls_timed_out: AtomicU64,
    pub notifications_received: AtomicU64,
    pub unrouted_notifications: AtomicU64,
    pub late_responses: AtomicU64,
    pub decode_errors: AtomicU64,
    pub connects: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub links_lost: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl SessionStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pending_calls: usize) -> SessionStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SessionStatsSnapshot {
            calls_sent: load(&self.calls_sent),
            calls_succeeded: load(&self.calls_succeeded),
            calls_failed: load(&self.calls_failed),
            calls_timed_out: load(&self.calls_timed_out),
            notifications_received: load(&self.notifications_received),
            unrouted_notifications: load(&self.unrouted_notifications),
            late_responses: load(&self.late_responses),
            decode_errors: load(&self.decode_errors),
            connects: load(&self.connects),
            reconnect_attempts: load(&self.reconnect_attempts),
            links_lost: load(&self.links_lost),
            health_check_failures: load(&self.health_check_failures),
            pending_calls,
        }
    }
}

/// Point-in-time copy of a session's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    pub calls_sent: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    /// Subset of `calls_failed`
    pub calls_timed_out: u64,
    pub notifications_received: u64,
    /// Notifications no router subscription matched
    pub unrouted_notifications: u64,
    /// Responses whose call had already completed
    pub late_responses: u64,
    pub decode_errors: u64,
    pub connects: u64,
    pub reconnect_attempts: u64,
    pub links_lost: u64,
    pub health_check_failures: u64,
    pub pending_calls: usize,
}

impl SessionStatsSnapshot {
    /// Fraction of completed calls that succeeded
    pub fn success_rate(&self) -> f64 {
        let total = self.calls_succeeded + self.calls_failed;
        if total == 0 {
            1.0
        } else {
            self.calls_succeeded as f64 / total as f64
        }
    }
}

impl fmt::Display for SessionStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session Stats:")?;
        writeln!(f, "  Calls: {} sent, {} ok, {} failed ({} timed out)",
            self.calls_sent, self.calls_succeeded, self.calls_failed, self.calls_timed_out)?;
        writeln!(f, "  Pending: {}", self.pending_calls)?;
        writeln!(f, "  Notifications: {} ({} unrouted)",
            self.notifications_received, self.unrouted_notifications)?;
        writeln!(f, "  Late responses: {}", self.late_responses)?;
        writeln!(f, "  Decode errors: {}", self.decode_errors)?;
        writeln!(f, "  Connects: {} ({} reconnect attempts, {} links lost)",
            self.connects, self.reconnect_attempts, self.links_lost)?;
        write!(f, "  Health check failures: {}", self.health_check_failures)
    }
}
