//! Background supervisor: liveness polling and reconnection
//!
//! One supervisor task runs per session from the first successful (or
//! retryably failed) `connect()` until `disconnect()`. While the session is
//! Connected it checks the device every poll interval and drops the link
//! when the device stops answering. While the session is Failed or lost its
//! link it reconnects with exponential backoff.
//!
//! The task only holds a `Weak` reference to the session between ticks, so
//! dropping the last `SessionManager` ends it.

use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::config::SessionConfig;
use crate::error::ConnectError;
use crate::session::{SessionInner, SessionManager};
use crate::state::ConnectionState;
use crate::stats::SessionStats;

pub(crate) fn spawn_supervisor(
    session: Weak<SessionInner>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<ConnectionState>,
) {
    tokio::spawn(supervise(session, cancel, state_rx));
}

/// Why the supervisor loop ended
#[derive(Debug)]
enum Exit {
    Cancelled,
    SessionDropped,
    Fatal,
}

async fn supervise(
    session: Weak<SessionInner>,
    cancel: CancellationToken,
    mut state_rx: watch::Receiver<ConnectionState>,
) {
    let Some(config) = session.upgrade().map(|inner| inner.config.clone()) else {
        return;
    };
    tracing::debug!("Supervisor started for {}", config.address);

    let mut backoff = ExponentialBackoff::new(config.backoff);
    let mut unanswered = 0u32;

    let exit = loop {
        let state = *state_rx.borrow_and_update();
        match state {
            ConnectionState::Connected => {
                backoff.reset();
                tokio::select! {
                    _ = cancel.cancelled() => break Exit::Cancelled,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break Exit::SessionDropped;
                        }
                        continue;
                    }
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }

                let Some(inner) = session.upgrade() else {
                    break Exit::SessionDropped;
                };
                supervise_tick(&inner, &config, &mut unanswered).await;
            }
            ConnectionState::Connecting => {
                tokio::select! {
                    _ = cancel.cancelled() => break Exit::Cancelled,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break Exit::SessionDropped;
                        }
                    }
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                let Some(intentional) = session
                    .upgrade()
                    .map(|inner| inner.is_intentionally_disconnected())
                else {
                    break Exit::SessionDropped;
                };

                if intentional || !config.auto_reconnect {
                    tokio::select! {
                        _ = cancel.cancelled() => break Exit::Cancelled,
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break Exit::SessionDropped;
                            }
                        }
                    }
                    continue;
                }

                let delay = backoff.next_delay();
                tracing::info!(
                    "Reconnecting to {} in {:?} (attempt {})",
                    config.address,
                    delay,
                    backoff.attempt()
                );
                tokio::select! {
                    _ = cancel.cancelled() => break Exit::Cancelled,
                    changed = state_rx.changed() => {
                        // Someone else connected or disconnected meanwhile
                        if changed.is_err() {
                            break Exit::SessionDropped;
                        }
                        continue;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(inner) = session.upgrade() else {
                    break Exit::SessionDropped;
                };
                if inner.is_intentionally_disconnected() {
                    continue;
                }

                SessionStats::incr(&inner.stats.reconnect_attempts);
                let credentials = inner.credentials();
                match inner.establish(&credentials, config.connect_timeout).await {
                    Ok(()) => {
                        tracing::info!("Reconnected to {}", config.address);
                        unanswered = 0;
                    }
                    Err(ConnectError::AlreadyConnecting) | Err(ConnectError::Cancelled) => {}
                    Err(error) if error.is_retryable() => {
                        tracing::warn!("Reconnect to {} failed: {}", config.address, error);
                    }
                    Err(error) => {
                        inner.release_supervisor();
                        inner.report_fatal(&error);
                        break Exit::Fatal;
                    }
                }
            }
        }
    };

    tracing::debug!("Supervisor for {} stopped: {:?}", config.address, exit);
}

/// One poll interval while Connected: staleness check, health check, refresh
async fn supervise_tick(
    inner: &Arc<SessionInner>,
    config: &SessionConfig,
    unanswered: &mut u32,
) {
    let epoch = inner.current_epoch();
    let session = SessionManager::from_inner(Arc::clone(inner));

    if let Some(check) = inner.health_check.clone() {
        let window = config.effective_staleness_window();
        if let Some(age) = inner.liveness_age() {
            if age > window {
                *unanswered = 0;
                inner
                    .drop_link(epoch, &format!("no sign of life for {:?}", age))
                    .await;
                return;
            }
        }

        let timeout = config.health_check_timeout;
        let result = match tokio::time::timeout(timeout, check.check(&session, timeout)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error.to_string()),
            Err(_) => Err(format!("no answer within {:?}", timeout)),
        };

        match result {
            Ok(()) => {
                *unanswered = 0;
                inner.mark_alive(epoch);
            }
            Err(reason) => {
                *unanswered += 1;
                SessionStats::incr(&inner.stats.health_check_failures);
                tracing::warn!(
                    "Health check {}/{} for {} failed: {}",
                    unanswered,
                    config.max_unanswered_health_checks,
                    config.address,
                    reason
                );
                if *unanswered >= config.max_unanswered_health_checks {
                    *unanswered = 0;
                    inner
                        .drop_link(epoch, "device stopped answering health checks")
                        .await;
                }
                return;
            }
        }
    }

    for action in inner.poll_actions() {
        if let Err(error) = action.poll(&session).await {
            tracing::warn!("Refresh of {} failed: {}", config.address, error);
        }
    }
}
