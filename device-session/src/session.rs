//! The device session manager
//!
//! A [`SessionManager`] owns the link to one device. It correlates
//! responses to calls, routes notifications, and runs the background
//! supervisor that polls the device and reconnects after failures.
//!
//! Each open link gets an epoch number. The reader task and the send slot
//! are tagged with the epoch they belong to, so a reader that is still
//! draining an old link can never tear down its successor.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use session_codec::{CallId, Codec, InboundMessage, Request};
use session_transport::{LinkReceiver, LinkSender, Transport};

use crate::backoff::RetryPolicy;
use crate::config::{CallMode, SessionConfig};
use crate::error::{CallError, ConnectError, SessionError};
use crate::events::{notify_all, SessionListener};
use crate::handshake::{Credentials, Handshake, HandshakeCaller, HandshakeContext, NoHandshake};
use crate::health::{HealthCheck, PollAction};
use crate::pending::{CallWaiter, PendingCallTable};
use crate::router::{NotificationListener, NotificationRouter};
use crate::scheduler;
use crate::state::ConnectionState;
use crate::stats::{SessionStats, SessionStatsSnapshot};

/// Handle to one device session. Cloning yields another handle to the
/// same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

/// Builder for [`SessionManager`]
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    codec: Option<Arc<dyn Codec>>,
    handshake: Arc<dyn Handshake>,
    health_check: Option<Arc<dyn HealthCheck>>,
    poll_actions: Vec<Arc<dyn PollAction>>,
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl SessionBuilder {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            transport: None,
            codec: None,
            handshake: Arc::new(NoHandshake),
            health_check: None,
            poll_actions: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub fn with_handshake(mut self, handshake: impl Handshake) -> Self {
        self.handshake = Arc::new(handshake);
        self
    }

    pub fn with_health_check(mut self, check: impl HealthCheck) -> Self {
        self.health_check = Some(Arc::new(check));
        self
    }

    /// Add an action run on every poll interval; actions run in the order added
    pub fn with_poll_action(mut self, action: impl PollAction) -> Self {
        self.poll_actions.push(Arc::new(action));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validate the configuration and create the session, initially Disconnected
    pub fn build(self) -> Result<SessionManager, SessionError> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or(SessionError::MissingComponent("transport"))?;
        let codec = self.codec.ok_or(SessionError::MissingComponent("codec"))?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        tracing::debug!(
            "Created session for {} ({} transport, {} codec, {} handshake)",
            self.config.address,
            transport.name(),
            codec.name(),
            self.handshake.name()
        );

        Ok(SessionManager {
            inner: Arc::new(SessionInner {
                config: self.config,
                transport,
                codec,
                handshake: self.handshake,
                health_check: self.health_check,
                poll_actions: RwLock::new(self.poll_actions),
                router: NotificationRouter::new(),
                listeners: RwLock::new(self.listeners),
                core: Mutex::new(SessionCore::default()),
                link: tokio::sync::Mutex::new(None),
                state_tx,
                next_id: AtomicU64::new(1),
                call_slot: Semaphore::new(1),
                stats: SessionStats::default(),
            }),
        })
    }
}

impl SessionManager {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Open the link and run the handshake, bounded by `timeout`.
    ///
    /// Connecting a Connected session is a no-op. Network failures and
    /// timeouts are returned and, with `auto_reconnect`, retried in the
    /// background. Authentication and protocol failures are not retried and
    /// are also reported through [`SessionListener::on_fatal_error`].
    pub async fn connect(&self, credentials: Credentials, timeout: Duration) -> Result<(), ConnectError> {
        let result = self.inner.establish(&credentials, timeout).await;
        match &result {
            Ok(()) => self.inner.ensure_supervisor(),
            Err(ConnectError::AlreadyConnecting) | Err(ConnectError::Cancelled) => {}
            Err(error) if error.is_retryable() => {
                if self.inner.config.auto_reconnect {
                    self.inner.ensure_supervisor();
                }
            }
            Err(error) => self.inner.report_fatal(error),
        }
        result
    }

    /// Tear the session down. Every pending call fails with
    /// [`CallError::Disconnected`]. Calling it again is harmless.
    pub async fn disconnect(&self) {
        self.inner.shutdown().await;
    }

    /// Send `request` and wait for its response.
    ///
    /// The session assigns the correlation id; any id already on the request
    /// is replaced. A [`CallError::Timeout`] does not mean the device ignored
    /// the request, only that no answer arrived in time.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Value, CallError> {
        self.inner.issue(request, timeout, CallGate::Connected).await
    }

    /// Call `method` with the configured default timeout
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.call(Request::with_params(method, params), self.inner.config.call_timeout)
            .await
    }

    /// Send a one-way request that the device does not answer
    pub async fn notify(&self, request: Request) -> Result<(), CallError> {
        self.inner.notify(request).await
    }

    /// Call with the default timeout, re-issuing on timeouts and transport
    /// failures as `policy` allows
    pub async fn call_with_retry(&self, request: Request, policy: &RetryPolicy) -> Result<Value, CallError> {
        let attempts = policy.max_attempts();
        let mut attempt = 0;
        loop {
            match self.call(request.clone(), self.inner.config.call_timeout).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt + 1 < attempts => {
                    let delay = policy.delay_after(attempt);
                    tracing::debug!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        request.method,
                        error,
                        attempt + 1,
                        attempts - 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>, listener: &Arc<dyn NotificationListener>) -> bool {
        self.inner.router.subscribe(topic, listener)
    }

    pub fn unsubscribe(&self, topic: &str, listener: &Arc<dyn NotificationListener>) -> bool {
        self.inner.router.unsubscribe(topic, listener)
    }

    pub fn unsubscribe_all(&self, listener: &Arc<dyn NotificationListener>) -> usize {
        self.inner.router.unsubscribe_all(listener)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Remove a listener added earlier. Returns false if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| !same_target(entry, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Run `action` on every poll interval from now on
    pub fn add_poll_action(&self, action: Arc<dyn PollAction>) {
        self.inner.poll_actions.write().push(action);
    }

    /// Stop running a poll action. Returns false if it was not registered.
    pub fn remove_poll_action(&self, action: &Arc<dyn PollAction>) -> bool {
        let mut actions = self.inner.poll_actions.write();
        let before = actions.len();
        actions.retain(|entry| !same_target(entry, action));
        actions.len() != before
    }

    pub fn poll_action_count(&self) -> usize {
        self.inner.poll_actions.read().len()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the session reaches `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        };
        reached
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.core.lock().pending.len()
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        let pending = self.pending_calls();
        self.inner.stats.snapshot(pending)
    }

    pub fn address(&self) -> &str {
        &self.inner.config.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.inner.router
    }

    /// Whether both handles refer to the same session
    pub fn same_session(&self, other: &SessionManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("address", &self.inner.config.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Which sessions a call is admitted on
#[derive(Debug, Clone, Copy)]
enum CallGate {
    /// Ordinary calls need a Connected session
    Connected,
    /// Handshake calls run while Connecting, on their own link only
    Handshake(u64),
}

impl CallGate {
    fn admits(self, core: &SessionCore) -> bool {
        match self {
            CallGate::Connected => core.state == ConnectionState::Connected,
            CallGate::Handshake(epoch) => {
                core.state == ConnectionState::Connecting && core.epoch == epoch
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StateChange {
    previous: ConnectionState,
    current: ConnectionState,
}

/// Data-pointer identity; vtable pointers for the same type may differ
fn same_target<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Everything guarded by the session lock
#[derive(Default)]
pub(crate) struct SessionCore {
    state: ConnectionState,
    pending: PendingCallTable,
    epoch: u64,
    last_liveness: Option<Instant>,
    credentials: Credentials,
    intentional_disconnect: bool,
    link_token: Option<CancellationToken>,
    supervisor: Option<CancellationToken>,
}

struct LinkSlot {
    epoch: u64,
    sender: Box<dyn LinkSender>,
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    handshake: Arc<dyn Handshake>,
    pub(crate) health_check: Option<Arc<dyn HealthCheck>>,
    poll_actions: RwLock<Vec<Arc<dyn PollAction>>>,
    router: NotificationRouter,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    core: Mutex<SessionCore>,
    link: tokio::sync::Mutex<Option<LinkSlot>>,
    state_tx: watch::Sender<ConnectionState>,
    next_id: AtomicU64,
    call_slot: Semaphore,
    pub(crate) stats: SessionStats,
}

/// Removes a call's pending entry if the caller stops waiting early
struct PendingGuard<'a> {
    core: &'a Mutex<SessionCore>,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.core.lock().pending.remove(self.id);
    }
}

impl SessionInner {
    fn set_state(&self, core: &mut SessionCore, next: ConnectionState) -> Option<StateChange> {
        let previous = core.state;
        if previous == next {
            return None;
        }
        if !previous.can_transition_to(next) {
            tracing::error!(
                "Rejected illegal state transition {} -> {} for {}",
                previous,
                next,
                self.config.address
            );
            return None;
        }
        core.state = next;
        self.state_tx.send_replace(next);
        Some(StateChange {
            previous,
            current: next,
        })
    }

    fn announce(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };
        tracing::info!(
            "Session {} {} -> {}",
            self.config.address,
            change.previous,
            change.current
        );
        let listeners = self.listeners.read().clone();
        notify_all(&listeners, "state change", |listener| {
            listener.on_connection_state_changed(change.previous, change.current)
        });
    }

    pub(crate) fn report_fatal(&self, error: &ConnectError) {
        tracing::error!(
            "Session {} stopped reconnecting: {}",
            self.config.address,
            error
        );
        let listeners = self.listeners.read().clone();
        notify_all(&listeners, "fatal error", |listener| listener.on_fatal_error(error));
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.core.lock().epoch
    }

    pub(crate) fn credentials(&self) -> Credentials {
        self.core.lock().credentials.clone()
    }

    pub(crate) fn is_intentionally_disconnected(&self) -> bool {
        self.core.lock().intentional_disconnect
    }

    /// Time since the last inbound frame or successful health check
    pub(crate) fn liveness_age(&self) -> Option<Duration> {
        self.core.lock().last_liveness.map(|at| at.elapsed())
    }

    /// Snapshot, so actions may add or remove themselves while running
    pub(crate) fn poll_actions(&self) -> Vec<Arc<dyn PollAction>> {
        self.poll_actions.read().clone()
    }

    pub(crate) fn mark_alive(&self, epoch: u64) {
        let mut core = self.core.lock();
        if core.epoch == epoch {
            core.last_liveness = Some(Instant::now());
        }
    }

    /// Start the supervisor unless one is running or the session was shut down
    pub(crate) fn ensure_supervisor(self: &Arc<Self>) {
        let token = {
            let mut core = self.core.lock();
            if core.intentional_disconnect || core.supervisor.is_some() {
                return;
            }
            let token = CancellationToken::new();
            core.supervisor = Some(token.clone());
            token
        };
        scheduler::spawn_supervisor(Arc::downgrade(self), token, self.state_tx.subscribe());
    }

    /// Called by a supervisor that stops on its own
    pub(crate) fn release_supervisor(&self) {
        self.core.lock().supervisor = None;
    }

    pub(crate) async fn establish(
        self: &Arc<Self>,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        let (epoch, link_token, change) = {
            let mut core = self.core.lock();
            match core.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(ConnectError::AlreadyConnecting),
                ConnectionState::Disconnected | ConnectionState::Failed => {}
            }
            core.intentional_disconnect = false;
            core.credentials = credentials.clone();
            core.epoch = core.epoch.wrapping_add(1);
            let token = CancellationToken::new();
            if let Some(previous) = core.link_token.replace(token.clone()) {
                previous.cancel();
            }
            let change = self.set_state(&mut core, ConnectionState::Connecting);
            (core.epoch, token, change)
        };
        self.announce(change);
        tracing::info!(
            "Connecting to {} via {} transport",
            self.config.address,
            self.transport.name()
        );

        let result = tokio::select! {
            biased;
            _ = link_token.cancelled() => Err(ConnectError::Cancelled),
            outcome = tokio::time::timeout(timeout, self.open_link(epoch, credentials, timeout, &link_token)) => {
                outcome.unwrap_or(Err(ConnectError::Timeout(timeout)))
            }
        };

        match result {
            Ok(()) => {
                let change = {
                    let mut core = self.core.lock();
                    if core.epoch == epoch && core.state == ConnectionState::Connecting {
                        core.last_liveness = Some(Instant::now());
                        Some(self.set_state(&mut core, ConnectionState::Connected))
                    } else {
                        None
                    }
                };
                match change {
                    Some(change) => {
                        SessionStats::incr(&self.stats.connects);
                        self.announce(change);
                        Ok(())
                    }
                    None => {
                        self.close_link(epoch).await;
                        Err(ConnectError::Cancelled)
                    }
                }
            }
            Err(error) => {
                let superseded = {
                    let mut core = self.core.lock();
                    if core.epoch == epoch && core.state == ConnectionState::Connecting {
                        link_token.cancel();
                        core.link_token = None;
                        core.pending.cancel_all(CallError::Disconnected);
                        Err(self.set_state(&mut core, ConnectionState::Failed))
                    } else {
                        Ok(())
                    }
                };
                self.close_link(epoch).await;
                match superseded {
                    // disconnect() won the race
                    Ok(()) => Err(ConnectError::Cancelled),
                    Err(change) => {
                        self.announce(change);
                        tracing::warn!("Connecting to {} failed: {}", self.config.address, error);
                        Err(error)
                    }
                }
            }
        }
    }

    async fn open_link(
        self: &Arc<Self>,
        epoch: u64,
        credentials: &Credentials,
        timeout: Duration,
        link_token: &CancellationToken,
    ) -> Result<(), ConnectError> {
        let link = self.transport.open(&self.config.address, timeout).await?;
        let (mut sender, receiver) = link.split();

        {
            let mut slot = self.link.lock().await;
            let current = self.current_epoch();
            if current != epoch {
                drop(slot);
                let _ = sender.close().await;
                return Err(ConnectError::Cancelled);
            }
            if let Some(mut stale) = slot.replace(LinkSlot { epoch, sender }) {
                let _ = stale.sender.close().await;
            }
        }

        tokio::spawn(read_loop(
            Arc::downgrade(self),
            receiver,
            epoch,
            link_token.clone(),
        ));

        let caller = HandshakeLink {
            inner: self.as_ref(),
            epoch,
        };
        let ctx = HandshakeContext::new(
            &caller,
            credentials,
            &self.config.address,
            self.config.call_timeout,
        );
        self.handshake.perform(&ctx).await
    }

    async fn send_frame(&self, epoch: u64, frame: bytes::Bytes) -> Result<(), CallError> {
        let mut slot = self.link.lock().await;
        match slot.as_mut() {
            Some(link) if link.epoch == epoch => link
                .sender
                .send(frame)
                .await
                .map_err(|e| CallError::Transport(e.to_string())),
            _ => Err(CallError::Disconnected),
        }
    }

    async fn close_link(&self, epoch: u64) {
        let taken = {
            let mut slot = self.link.lock().await;
            match slot.as_ref() {
                Some(link) if link.epoch == epoch => slot.take(),
                _ => None,
            }
        };
        if let Some(mut link) = taken {
            if let Err(e) = link.sender.close().await {
                tracing::debug!("Closing link to {} failed: {}", self.config.address, e);
            }
        }
    }

    async fn issue(&self, mut request: Request, timeout: Duration, gate: CallGate) -> Result<Value, CallError> {
        if !gate.admits(&self.core.lock()) {
            return Err(CallError::NotConnected);
        }

        let _permit = match self.config.call_mode {
            CallMode::SingleSlot => Some(
                self.call_slot
                    .acquire()
                    .await
                    .map_err(|_| CallError::Disconnected)?,
            ),
            CallMode::Multiplexed => None,
        };

        // Sending and waiting for the response share one deadline
        let deadline = tokio::time::Instant::now() + timeout;
        let id = CallId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        request.id = Some(id);
        let frame = self.codec.encode(&request)?;

        let (waiter, epoch) = {
            let mut core = self.core.lock();
            if !gate.admits(&core) {
                return Err(CallError::NotConnected);
            }
            let waiter = core.pending.register(id, request.method.as_str())?;
            (waiter, core.epoch)
        };
        let _guard = PendingGuard {
            core: &self.core,
            id,
        };

        tracing::debug!("Sending {} {} to {}", id, request.method, self.config.address);
        let outcome = match tokio::time::timeout_at(deadline, self.send_frame(epoch, frame)).await {
            Ok(Ok(())) => {
                SessionStats::incr(&self.stats.calls_sent);
                self.await_outcome(id, waiter, deadline, timeout).await
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(CallError::Timeout { id, timeout }),
        };

        match &outcome {
            Ok(_) => SessionStats::incr(&self.stats.calls_succeeded),
            Err(error) => {
                SessionStats::incr(&self.stats.calls_failed);
                if matches!(error, CallError::Timeout { .. }) {
                    SessionStats::incr(&self.stats.calls_timed_out);
                }
                tracing::debug!("Call {} {} failed: {}", id, request.method, error);
            }
        }
        outcome
    }

    async fn await_outcome(
        &self,
        id: CallId,
        mut waiter: CallWaiter,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        match tokio::time::timeout_at(deadline, &mut waiter).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::Disconnected),
            Err(_) => {
                self.core.lock().pending.expire(id);
                // A response that raced the expiry is already in the channel
                waiter
                    .try_recv()
                    .unwrap_or(Err(CallError::Timeout { id, timeout }))
            }
        }
    }

    async fn notify(&self, mut request: Request) -> Result<(), CallError> {
        let epoch = {
            let core = self.core.lock();
            if core.state != ConnectionState::Connected {
                return Err(CallError::NotConnected);
            }
            core.epoch
        };
        request.id = None;
        let frame = self.codec.encode(&request)?;
        tracing::debug!("Sending notification {} to {}", request.method, self.config.address);
        self.send_frame(epoch, frame).await
    }

    fn handle_frame(&self, epoch: u64, frame: &[u8]) {
        let message = match self.codec.decode(frame) {
            Ok(message) => message,
            Err(e) => {
                SessionStats::incr(&self.stats.decode_errors);
                tracing::warn!("Dropping undecodable frame from {}: {}", self.config.address, e);
                return;
            }
        };
        self.mark_alive(epoch);

        match message {
            InboundMessage::Response { id, result } => {
                let resolved = self
                    .core
                    .lock()
                    .pending
                    .resolve(id, result.map_err(CallError::Remote));
                if !resolved {
                    SessionStats::incr(&self.stats.late_responses);
                }
            }
            InboundMessage::Notification { topic, payload } => {
                SessionStats::incr(&self.stats.notifications_received);
                tracing::debug!("Notification {} from {}", topic, self.config.address);

                let report = self.router.dispatch(&topic, &payload);
                if report.delivered + report.failed == 0 {
                    SessionStats::incr(&self.stats.unrouted_notifications);
                }
                let listeners = self.listeners.read().clone();
                notify_all(&listeners, "notification", |listener| {
                    listener.on_notification(&topic, &payload)
                });
            }
        }
    }

    /// Tear down the link of `epoch` after it failed. No-op for stale epochs.
    pub(crate) async fn drop_link(&self, epoch: u64, reason: &str) {
        let change = {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                return;
            }
            match core.state {
                ConnectionState::Connected => {
                    if let Some(token) = core.link_token.take() {
                        token.cancel();
                    }
                    core.pending.cancel_all(CallError::Disconnected);
                    core.last_liveness = None;
                    self.set_state(&mut core, ConnectionState::Disconnected)
                }
                // The connect attempt notices through its failing handshake
                ConnectionState::Connecting => {
                    core.pending.cancel_all(CallError::Disconnected);
                    None
                }
                ConnectionState::Disconnected | ConnectionState::Failed => return,
            }
        };

        if change.is_some() {
            SessionStats::incr(&self.stats.links_lost);
        }
        tracing::warn!("Link to {} lost: {}", self.config.address, reason);
        self.close_link(epoch).await;
        self.announce(change);
    }

    async fn shutdown(&self) {
        let (change, supervisor, link_token) = {
            let mut core = self.core.lock();
            core.intentional_disconnect = true;
            core.epoch = core.epoch.wrapping_add(1);
            core.last_liveness = None;
            core.pending.cancel_all(CallError::Disconnected);
            let change = self.set_state(&mut core, ConnectionState::Disconnected);
            (change, core.supervisor.take(), core.link_token.take())
        };

        if let Some(token) = supervisor {
            token.cancel();
        }
        if let Some(token) = link_token {
            token.cancel();
        }

        let taken = self.link.lock().await.take();
        if let Some(mut link) = taken {
            if let Err(e) = link.sender.close().await {
                tracing::debug!("Closing link to {} failed: {}", self.config.address, e);
            }
            tracing::info!("Closed link to {}", self.config.address);
        }
        self.announce(change);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if let Some(token) = core.supervisor.take() {
            token.cancel();
        }
        if let Some(token) = core.link_token.take() {
            token.cancel();
        }
    }
}

/// Issues handshake calls on the link being established
struct HandshakeLink<'a> {
    inner: &'a SessionInner,
    epoch: u64,
}

#[async_trait]
impl HandshakeCaller for HandshakeLink<'_> {
    async fn handshake_call(&self, request: Request, timeout: Duration) -> Result<Value, CallError> {
        self.inner
            .issue(request, timeout, CallGate::Handshake(self.epoch))
            .await
    }
}

async fn read_loop(
    session: Weak<SessionInner>,
    mut receiver: Box<dyn LinkReceiver>,
    epoch: u64,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = receiver.receive() => frame,
        };
        let Some(inner) = session.upgrade() else {
            return;
        };

        match frame {
            Ok(Some(frame)) => inner.handle_frame(epoch, &frame),
            Ok(None) => {
                inner.drop_link(epoch, "closed by device").await;
                return;
            }
            Err(e) => {
                inner.drop_link(epoch, &e.to_string()).await;
                return;
            }
        }
    }
}
