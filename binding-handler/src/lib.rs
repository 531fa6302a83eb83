//! # binding-handler
//!
//! Binds a [`device_session::SessionManager`] to a host's view of a device:
//! thing status, channels and commands.
//!
//! A handler is composed from two parts:
//!
//! - a [`DeviceVariant`], which knows one kind of device (its topics, how to
//!   decode notifications, how to refresh and how to execute commands)
//! - a session shared through the [`SessionRegistry`], so that handlers
//!   fronting the same physical device reuse one connection
//!
//! ```rust,no_run
//! use binding_handler::{Command, CommandValue, DeviceHandler, KodiVariant, SessionRegistry};
//! use device_session::session_codec::JsonRpcCodec;
//! use device_session::session_transport::TcpLineTransport;
//! use device_session::{Credentials, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(SessionRegistry::new());
//! let (handler, mut events) = DeviceHandler::new(
//!     "kodi:living-room",
//!     KodiVariant::new(),
//!     SessionConfig::new("192.168.1.20:9090"),
//!     TcpLineTransport::new(),
//!     JsonRpcCodec::new(),
//!     Arc::clone(&registry),
//! )?;
//!
//! handler.initialize(Credentials::none()).await?;
//! handler
//!     .handle_command(Command::new("volume", CommandValue::Percent(30)))
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod handler;
pub mod registry;
pub mod status;
pub mod variant;
pub mod variants;

pub use error::{HandlerError, Result};
pub use handler::DeviceHandler;
pub use registry::SessionRegistry;
pub use status::{
    ChannelState, ChannelUpdate, Command, CommandValue, HandlerEvent, OfflineReason, ThingStatus,
};
pub use variant::DeviceVariant;
pub use variants::KodiVariant;
