//! One session per device identity
//!
//! Several handlers can front the same physical device (a controller and its
//! child things, for instance). The registry hands every one of them the same
//! [`SessionManager`] and disconnects it when the last user releases it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use device_session::{SessionError, SessionManager};

struct RegistryEntry {
    session: SessionManager,
    users: usize,
}

/// Shared sessions keyed by device identity (usually the device address)
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, RegistryEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `identity`, creating it with `factory` on first
    /// use. Every successful acquire must be paired with a [`release`].
    ///
    /// `factory` runs while the registry shard is locked and must not call
    /// back into the registry.
    ///
    /// [`release`]: SessionRegistry::release
    pub fn acquire<F>(&self, identity: &str, factory: F) -> Result<SessionManager, SessionError>
    where
        F: FnOnce() -> Result<SessionManager, SessionError>,
    {
        match self.sessions.entry(identity.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.users += 1;
                tracing::debug!("Sharing session for {} ({} users)", identity, entry.users);
                Ok(entry.session.clone())
            }
            Entry::Vacant(vacant) => {
                let session = factory()?;
                vacant.insert(RegistryEntry {
                    session: session.clone(),
                    users: 1,
                });
                tracing::debug!("Created session for {}", identity);
                Ok(session)
            }
        }
    }

    /// Drop one user of `identity`. The last release disconnects the session
    /// and returns true.
    pub async fn release(&self, identity: &str) -> bool {
        let closing = match self.sessions.entry(identity.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.users = entry.users.saturating_sub(1);
                if entry.users == 0 {
                    Some(occupied.remove().session)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => {
                tracing::warn!("Release of unknown session {}", identity);
                None
            }
        };

        match closing {
            Some(session) => {
                tracing::debug!("Last user released {}, disconnecting", identity);
                session.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, identity: &str) -> Option<SessionManager> {
        self.sessions.get(identity).map(|entry| entry.session.clone())
    }

    /// Number of handlers currently holding `identity`
    pub fn users(&self, identity: &str) -> usize {
        self.sessions.get(identity).map(|entry| entry.users).unwrap_or(0)
    }

    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        identities.sort();
        identities
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Disconnect and forget every session regardless of users
    pub async fn shutdown_all(&self) {
        let sessions: Vec<SessionManager> = self
            .identities()
            .into_iter()
            .filter_map(|identity| self.sessions.remove(&identity).map(|(_, entry)| entry.session))
            .collect();

        if !sessions.is_empty() {
            tracing::info!("Shutting down {} device sessions", sessions.len());
        }
        for session in sessions {
            session.disconnect().await;
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("identities", &self.identities())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_session::session_codec::JsonRpcCodec;
    use device_session::session_transport::MemoryTransport;
    use device_session::{ConnectionState, Credentials, SessionConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn factory(address: &str, transport: &MemoryTransport) -> Result<SessionManager, SessionError> {
        SessionManager::builder(SessionConfig::no_reconnect(address))
            .with_transport(transport.clone())
            .with_codec(JsonRpcCodec::new())
            .build()
    }

    #[tokio::test]
    async fn test_acquire_shares_one_session_per_identity() {
        let registry = SessionRegistry::new();
        let (transport, _acceptor) = MemoryTransport::new();
        let built = AtomicUsize::new(0);

        let first = registry
            .acquire("kodi:living", || {
                built.fetch_add(1, Ordering::SeqCst);
                factory("living", &transport)
            })
            .unwrap();
        let second = registry
            .acquire("kodi:living", || {
                built.fetch_add(1, Ordering::SeqCst);
                factory("living", &transport)
            })
            .unwrap();
        let other = registry.acquire("kodi:bedroom", || factory("bedroom", &transport)).unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(first.same_session(&second));
        assert!(!first.same_session(&other));
        assert_eq!(registry.users("kodi:living"), 2);
        assert_eq!(registry.identities(), vec!["kodi:bedroom", "kodi:living"]);
    }

    #[tokio::test]
    async fn test_factory_error_leaves_no_entry() {
        let registry = SessionRegistry::new();
        let result = registry.acquire("broken", || {
            SessionManager::builder(SessionConfig::new("broken")).build()
        });

        assert!(matches!(result, Err(SessionError::MissingComponent(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_last_release_disconnects() {
        let registry = SessionRegistry::new();
        let (transport, mut acceptor) = MemoryTransport::new();

        let session = registry.acquire("kodi", || factory("kodi", &transport)).unwrap();
        registry.acquire("kodi", || factory("kodi", &transport)).unwrap();
        session.connect(Credentials::none(), Duration::from_secs(1)).await.unwrap();
        let _device = acceptor.accept().await.unwrap();

        assert!(!registry.release("kodi").await);
        assert_eq!(session.state(), ConnectionState::Connected);

        assert!(registry.release("kodi").await);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(transport.close_count(), 1);
        assert!(registry.get("kodi").is_none());
    }

    #[tokio::test]
    async fn test_release_unknown_identity() {
        let registry = SessionRegistry::new();
        assert!(!registry.release("nobody").await);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let registry = SessionRegistry::new();
        let (transport, _acceptor) = MemoryTransport::new();
        registry.acquire("a", || factory("a", &transport)).unwrap();
        registry.acquire("b", || factory("b", &transport)).unwrap();
        registry.acquire("b", || factory("b", &transport)).unwrap();

        registry.shutdown_all().await;
        assert_eq!(registry.len(), 0);
    }
}
