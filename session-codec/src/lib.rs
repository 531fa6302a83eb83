//! # session-codec
//!
//! Typed device messages and the codecs that translate them to wire frames.
//!
//! A codec is the only protocol-specific piece a device session needs: the
//! session hands it [`Request`]s to encode and raw frames to decode into
//! [`InboundMessage`]s, and does request correlation and notification
//! routing on the typed values.
//!
//! ```rust
//! use session_codec::{CallId, Codec, InboundMessage, JsonRpcCodec, Request};
//!
//! let codec = JsonRpcCodec::new();
//! let frame = codec.encode(&Request::new("JSONRPC.Ping").with_id(CallId::new(1))).unwrap();
//! assert!(!frame.is_empty());
//!
//! let reply = codec.decode(br#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#).unwrap();
//! assert!(matches!(reply, InboundMessage::Response { .. }));
//! ```

pub mod error;
pub mod json_rpc;
pub mod message;

pub use error::{CodecError, CodecResult};
pub use json_rpc::JsonRpcCodec;
pub use message::{CallId, InboundMessage, RemoteError, Request};

use bytes::Bytes;

/// Encodes outgoing requests and decodes inbound frames for one protocol family
pub trait Codec: Send + Sync + 'static {
    /// Encode a request into one transport frame
    fn encode(&self, request: &Request) -> CodecResult<Bytes>;

    /// Decode one transport frame
    fn decode(&self, frame: &[u8]) -> CodecResult<InboundMessage>;

    /// Short name used in log output
    fn name(&self) -> &'static str;
}
