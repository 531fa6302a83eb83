//! A device handler: one variant composed with a shared session
//!
//! The handler translates between the session world (connection states,
//! notifications, calls) and the host world (thing status, channel updates,
//! commands). Everything device-specific comes from the [`DeviceVariant`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use device_session::session_codec::Codec;
use device_session::session_transport::Transport;
use device_session::{
    CallError, ConnectError, ConnectionState, Credentials, ListenerError, NotificationListener,
    PollAction, SessionConfig, SessionListener, SessionManager,
};

use crate::error::{HandlerError, Result};
use crate::registry::SessionRegistry;
use crate::status::{ChannelUpdate, Command, CommandValue, HandlerEvent, ThingStatus};
use crate::variant::DeviceVariant;

/// Where a handler's events go; shared with the session-side adapters
struct EventSink {
    thing_id: String,
    tx: mpsc::UnboundedSender<HandlerEvent>,
    status: Mutex<ThingStatus>,
    disposed: AtomicBool,
}

impl EventSink {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn status(&self) -> ThingStatus {
        self.status.lock().clone()
    }

    /// Record a new status, emitting an event only when it changed
    fn set_status(&self, status: ThingStatus) {
        if self.is_disposed() {
            return;
        }
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        tracing::info!("{} is now {}", self.thing_id, status);
        let _ = self.tx.send(HandlerEvent::StatusChanged {
            thing_id: self.thing_id.clone(),
            status,
        });
    }

    fn channel_updates(&self, updates: Vec<ChannelUpdate>) {
        if self.is_disposed() {
            return;
        }
        for update in updates {
            tracing::trace!("{} channel {} = {:?}", self.thing_id, update.channel, update.state);
            let _ = self.tx.send(HandlerEvent::ChannelUpdated {
                thing_id: self.thing_id.clone(),
                update,
            });
        }
    }
}

/// Follows the session's connection state
struct StatusTracker {
    sink: Arc<EventSink>,
}

impl SessionListener for StatusTracker {
    fn on_connection_state_changed(&self, _previous: ConnectionState, current: ConnectionState) {
        let status = ThingStatus::from_connection_state(current, &self.sink.status());
        self.sink.set_status(status);
    }

    fn on_fatal_error(&self, error: &ConnectError) {
        self.sink.set_status(ThingStatus::configuration_error(error.to_string()));
    }
}

/// Routes the variant's topics into channel updates
struct VariantNotifications<V> {
    variant: Arc<V>,
    sink: Arc<EventSink>,
}

impl<V: DeviceVariant> NotificationListener for VariantNotifications<V> {
    fn on_notification(&self, topic: &str, payload: &Value) -> std::result::Result<(), ListenerError> {
        let updates = self.variant.decode_notification(topic, payload);
        if updates.is_empty() {
            tracing::debug!("{} ignored notification {}", self.sink.thing_id, topic);
        }
        self.sink.channel_updates(updates);
        Ok(())
    }
}

/// Periodic refresh for one handler; every handler on a shared session
/// registers its own
struct VariantPoller<V> {
    variant: Arc<V>,
    sink: Arc<EventSink>,
}

#[async_trait]
impl<V: DeviceVariant> PollAction for VariantPoller<V> {
    async fn poll(&self, session: &SessionManager) -> std::result::Result<(), CallError> {
        if self.sink.is_disposed() {
            return Ok(());
        }
        let updates = self.variant.refresh(session).await?;
        self.sink.channel_updates(updates);
        Ok(())
    }
}

/// Host-facing handler for one device.
///
/// Sessions are shared through a [`SessionRegistry`] keyed by the device
/// address; the first handler for an address builds the session, later ones
/// join it. Each handler attaches its own status listener and poll action to
/// the session and takes them off again when it is disposed.
pub struct DeviceHandler<V: DeviceVariant> {
    variant: Arc<V>,
    session: SessionManager,
    identity: String,
    registry: Arc<SessionRegistry>,
    sink: Arc<EventSink>,
    notifications: Arc<dyn NotificationListener>,
    tracker: Arc<dyn SessionListener>,
    poller: Option<Arc<dyn PollAction>>,
}

impl<V: DeviceVariant> DeviceHandler<V> {
    /// Create the handler and the receiver for its events
    pub fn new(
        thing_id: impl Into<String>,
        variant: V,
        config: SessionConfig,
        transport: impl Transport,
        codec: impl Codec,
        registry: Arc<SessionRegistry>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HandlerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(EventSink {
            thing_id: thing_id.into(),
            tx,
            status: Mutex::new(ThingStatus::Unknown),
            disposed: AtomicBool::new(false),
        });
        let variant = Arc::new(variant);
        let identity = config.address.clone();

        let session = registry.acquire(&identity, || {
            let mut builder = SessionManager::builder(config)
                .with_transport(transport)
                .with_codec(codec)
                .with_handshake(variant.handshake());
            if let Some(check) = variant.health_check() {
                builder = builder.with_health_check(check);
            }
            builder.build()
        })?;

        let tracker: Arc<dyn SessionListener> = Arc::new(StatusTracker {
            sink: Arc::clone(&sink),
        });
        session.add_listener(Arc::clone(&tracker));

        let poller = variant.should_poll().then(|| {
            let poller: Arc<dyn PollAction> = Arc::new(VariantPoller {
                variant: Arc::clone(&variant),
                sink: Arc::clone(&sink),
            });
            session.add_poll_action(Arc::clone(&poller));
            poller
        });

        let notifications: Arc<dyn NotificationListener> = Arc::new(VariantNotifications {
            variant: Arc::clone(&variant),
            sink: Arc::clone(&sink),
        });

        tracing::debug!(
            "Created {} handler {} for {}",
            variant.name(),
            sink.thing_id,
            identity
        );

        let handler = Self {
            variant,
            session,
            identity,
            registry,
            sink,
            notifications,
            tracker,
            poller,
        };
        Ok((handler, rx))
    }

    /// Subscribe to the variant's topics, connect and read the initial state.
    ///
    /// A device that cannot be reached leaves the handler Offline with a
    /// communication error and returns Ok; the session keeps retrying in the
    /// background. Rejected credentials or a protocol mismatch are returned
    /// as errors and leave the handler Offline with a configuration error.
    pub async fn initialize(&self, credentials: Credentials) -> Result<()> {
        self.ensure_live()?;

        for topic in self.variant.topics() {
            self.session.subscribe(topic, &self.notifications);
        }

        let timeout = self.session.config().connect_timeout;
        match self.session.connect(credentials, timeout).await {
            Ok(()) | Err(ConnectError::AlreadyConnecting) => {}
            Err(error) if error.is_retryable() || matches!(error, ConnectError::Cancelled) => {
                self.sink
                    .set_status(ThingStatus::communication_error(error.to_string()));
                return Ok(());
            }
            Err(error) => {
                self.sink
                    .set_status(ThingStatus::configuration_error(error.to_string()));
                return Err(error.into());
            }
        }

        if self.session.state() != ConnectionState::Connected {
            return Ok(());
        }
        self.sink.set_status(ThingStatus::Online);

        match self.variant.refresh(&self.session).await {
            Ok(updates) => self.sink.channel_updates(updates),
            Err(error) => tracing::warn!("Initial refresh of {} failed: {}", self.sink.thing_id, error),
        }
        Ok(())
    }

    /// Execute a host command. `Refresh` re-reads the device and reports only
    /// the addressed channel.
    pub async fn handle_command(&self, command: Command) -> Result<()> {
        self.ensure_live()?;

        let updates = match command.value {
            CommandValue::Refresh => self
                .variant
                .refresh(&self.session)
                .await?
                .into_iter()
                .filter(|update| update.channel == command.channel)
                .collect(),
            _ => self.variant.command(&self.session, &command).await?,
        };
        self.sink.channel_updates(updates);
        Ok(())
    }

    /// Stop reporting and give the session back to the registry. The session
    /// is disconnected once no handler uses it. Calling it twice is harmless.
    pub async fn dispose(&self) {
        if self.sink.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach();
        self.registry.release(&self.identity).await;
        tracing::debug!("Disposed handler {}", self.sink.thing_id);
    }

    pub fn status(&self) -> ThingStatus {
        self.sink.status()
    }

    pub fn thing_id(&self) -> &str {
        &self.sink.thing_id
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn variant(&self) -> &V {
        &self.variant
    }

    /// Take this handler's listeners and poll action off the session
    fn detach(&self) {
        self.session.unsubscribe_all(&self.notifications);
        self.session.remove_listener(&self.tracker);
        if let Some(poller) = &self.poller {
            self.session.remove_poll_action(poller);
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.sink.is_disposed() {
            return Err(HandlerError::Disposed(self.sink.thing_id.clone()));
        }
        Ok(())
    }
}

impl<V: DeviceVariant> Drop for DeviceHandler<V> {
    fn drop(&mut self) {
        if self.sink.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Handler {} dropped without dispose()", self.sink.thing_id);
        self.detach();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let registry = Arc::clone(&self.registry);
            let identity = self.identity.clone();
            runtime.spawn(async move {
                registry.release(&identity).await;
            });
        }
    }
}

impl<V: DeviceVariant> std::fmt::Debug for DeviceHandler<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandler")
            .field("thing_id", &self.sink.thing_id)
            .field("variant", &self.variant.name())
            .field("identity", &self.identity)
            .field("status", &self.sink.status())
            .finish()
    }
}
