//! # device-session
//!
//! A long-lived session with one remote device: request/response
//! correlation, unsolicited notification routing, liveness polling and
//! reconnection with backoff.
//!
//! The session is protocol-agnostic. It moves frames through a
//! [`Transport`](session_transport::Transport) and understands them through a
//! [`Codec`](session_codec::Codec); everything device-specific (login,
//! health probe, refresh) is plugged in through small traits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use device_session::{Credentials, MethodHealthCheck, SessionConfig, SessionManager};
//! use session_codec::JsonRpcCodec;
//! use session_transport::TcpLineTransport;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = SessionManager::builder(SessionConfig::new("192.168.1.20:9090"))
//!     .with_transport(TcpLineTransport::new())
//!     .with_codec(JsonRpcCodec::new())
//!     .with_health_check(MethodHealthCheck::new("JSONRPC.Ping"))
//!     .build()?;
//!
//! session.connect(Credentials::none(), Duration::from_secs(10)).await?;
//! let volume = session
//!     .invoke("Application.GetProperties", json!({"properties": ["volume"]}))
//!     .await?;
//! println!("volume: {}", volume["volume"]);
//!
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`SessionManager`]: public handle; owns the connection state machine
//! - [`PendingCallTable`]: in-flight calls keyed by correlation id
//! - [`NotificationRouter`]: topic → weakly held listeners
//! - supervisor task: health checks, staleness, reconnect backoff
//! - reader task: decodes inbound frames and routes them
//!
//! Both background tasks are cancelled by [`SessionManager::disconnect`].

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod health;
pub mod logging;
pub mod pending;
pub mod router;
mod scheduler;
pub mod session;
pub mod state;
mod stats;

pub use backoff::{BackoffConfig, ExponentialBackoff, RetryPolicy};
pub use config::{CallMode, SessionConfig};
pub use error::{CallError, ConnectError, Result, SessionError};
pub use events::{ChannelSessionListener, SessionEvent, SessionListener};
pub use handshake::{
    connect_error_from_call, Credentials, Handshake, HandshakeContext, LoginHandshake,
    NoHandshake, ProbeHandshake,
};
pub use health::{HealthCheck, MethodHealthCheck, PollAction};
pub use pending::{CallOutcome, DuplicateCallId, PendingCall, PendingCallTable};
pub use router::{DispatchReport, ListenerError, NotificationListener, NotificationRouter};
pub use session::{SessionBuilder, SessionManager};
pub use state::ConnectionState;
pub use stats::SessionStatsSnapshot;

// Re-export the collaborator crates so hosts need only one dependency
pub use session_codec;
pub use session_transport;
