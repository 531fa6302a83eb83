//! JSON-RPC 2.0 codec
//!
//! The framing used by Kodi's socket API and several other media devices.
//! Responses echo the request `id` and carry either `result` or `error`.
//! Frames that carry a `method` are device-originated and surface as
//! notifications whose topic is the method name (`Player.OnPlay`,
//! `Application.OnVolumeChanged`, ...).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CallId, Codec, CodecError, CodecResult, InboundMessage, RemoteError, Request};

const VERSION: &str = "2.0";

#[derive(Serialize)]
struct OutgoingRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "is_null")]
    params: &'a Value,
}

fn is_null(value: &&Value) -> bool {
    value.is_null()
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

/// Codec for JSON-RPC 2.0 text frames
#[derive(Debug, Clone, Default)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self
    }

    fn parse_id(id: &Value) -> CodecResult<Option<CallId>> {
        match id {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_u64()
                .map(|v| Some(CallId::new(v)))
                .ok_or_else(|| CodecError::Malformed(format!("unsupported id {}", n))),
            // Some firmwares echo ids back as strings
            Value::String(s) => s
                .parse::<u64>()
                .map(|v| Some(CallId::new(v)))
                .map_err(|_| CodecError::Malformed(format!("unsupported id \"{}\"", s))),
            other => Err(CodecError::Malformed(format!("unsupported id {}", other))),
        }
    }
}

impl Codec for JsonRpcCodec {
    fn encode(&self, request: &Request) -> CodecResult<Bytes> {
        if request.method.is_empty() {
            return Err(CodecError::Encode("method name is empty".to_string()));
        }
        let outgoing = OutgoingRequest {
            jsonrpc: VERSION,
            id: request.id.map(|id| id.as_u64()),
            method: &request.method,
            params: &request.params,
        };
        let json = serde_json::to_vec(&outgoing)?;
        Ok(Bytes::from(json))
    }

    fn decode(&self, frame: &[u8]) -> CodecResult<InboundMessage> {
        let raw: RawMessage = serde_json::from_slice(frame)?;
        let id = match &raw.id {
            Some(id) => Self::parse_id(id)?,
            None => None,
        };

        if let Some(method) = raw.method {
            // Device-initiated requests are routed like notifications; the
            // session never answers them.
            return Ok(InboundMessage::Notification {
                topic: method,
                payload: raw.params.unwrap_or(Value::Null),
            });
        }

        match (id, raw.error) {
            (Some(id), Some(error)) => Ok(InboundMessage::Response {
                id,
                result: Err(error),
            }),
            (Some(id), None) => Ok(InboundMessage::Response {
                id,
                result: Ok(raw.result.unwrap_or(Value::Null)),
            }),
            (None, Some(error)) => Err(CodecError::UnexpectedMessage(format!(
                "error without id: {}",
                error
            ))),
            (None, None) => Err(CodecError::UnexpectedMessage(
                "frame has neither id nor method".to_string(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "json-rpc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_encode_request() {
        let codec = JsonRpcCodec::new();
        let request = Request::with_params("Application.GetProperties", json!({"properties": ["version"]}))
            .with_id(CallId::new(7));
        let bytes = codec.encode(&request).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "Application.GetProperties",
                "params": {"properties": ["version"]}
            })
        );
    }

    #[test]
    fn test_encode_notification_omits_id_and_null_params() {
        let codec = JsonRpcCodec::new();
        let bytes = codec.encode(&Request::new("Input.Home")).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "Input.Home"}));
    }

    #[test]
    fn test_encode_rejects_empty_method() {
        let codec = JsonRpcCodec::new();
        assert!(matches!(
            codec.encode(&Request::new("")),
            Err(CodecError::Encode(_))
        ));
    }

    #[rstest]
    #[case(r#"{"jsonrpc":"2.0","id":5,"result":"pong"}"#, 5)]
    #[case(r#"{"jsonrpc":"2.0","id":"12","result":"pong"}"#, 12)]
    fn test_decode_success_response(#[case] frame: &str, #[case] expected_id: u64) {
        let message = JsonRpcCodec::new().decode(frame.as_bytes()).unwrap();
        assert_eq!(
            message,
            InboundMessage::Response {
                id: CallId::new(expected_id),
                result: Ok(json!("pong")),
            }
        );
    }

    #[test]
    fn test_decode_null_result() {
        let message = JsonRpcCodec::new()
            .decode(br#"{"jsonrpc":"2.0","id":1,"result":null}"#)
            .unwrap();
        assert_eq!(
            message,
            InboundMessage::Response {
                id: CallId::new(1),
                result: Ok(Value::Null),
            }
        );
    }

    #[test]
    fn test_decode_error_response() {
        let message = JsonRpcCodec::new()
            .decode(br#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found."}}"#)
            .unwrap();
        match message {
            InboundMessage::Response { id, result: Err(error) } => {
                assert_eq!(id, CallId::new(2));
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "Method not found.");
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_notification() {
        let frame = br#"{"jsonrpc":"2.0","method":"Player.OnPause","params":{"data":{"player":{"playerid":1}},"sender":"xbmc"}}"#;
        let message = JsonRpcCodec::new().decode(frame).unwrap();
        match message {
            InboundMessage::Notification { topic, payload } => {
                assert_eq!(topic, "Player.OnPause");
                assert_eq!(payload["sender"], "xbmc");
            }
            other => panic!("Expected notification, got {:?}", other),
        }
    }

    #[rstest]
    #[case(b"not json".as_slice())]
    #[case(br#"{"jsonrpc":"2.0"}"#.as_slice())]
    #[case(br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#.as_slice())]
    #[case(br#"{"jsonrpc":"2.0","id":-4,"result":1}"#.as_slice())]
    #[case(br#"{"jsonrpc":"2.0","id":"abc","result":1}"#.as_slice())]
    fn test_decode_rejects(#[case] frame: &[u8]) {
        assert!(JsonRpcCodec::new().decode(frame).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_response_id_survives_decode(id in proptest::prelude::any::<u64>(), as_string in proptest::prelude::any::<bool>()) {
            let raw_id = if as_string { json!(id.to_string()) } else { json!(id) };
            let frame = json!({"jsonrpc": "2.0", "id": raw_id, "result": true}).to_string();
            match JsonRpcCodec::new().decode(frame.as_bytes()).unwrap() {
                InboundMessage::Response { id: decoded, .. } => proptest::prop_assert_eq!(decoded, CallId::new(id)),
                other => proptest::prop_assert!(false, "Expected response, got {:?}", other),
            }
        }
    }
}
