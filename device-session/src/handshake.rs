//! Session establishment after the link is open
//!
//! Some devices accept commands as soon as the socket is up, others want a
//! login or a version probe first. A [`Handshake`] runs while the session is
//! still `Connecting`; its calls go over the fresh link even though ordinary
//! callers are still refused with `NotConnected`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use session_codec::Request;

use crate::error::{CallError, ConnectError};

/// Login material for a device. `Debug` never prints secrets.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl Credentials {
    /// No credentials
    pub fn none() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            token: None,
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none() && self.token.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("token", &redact(&self.token))
            .finish()
    }
}

/// Issues calls on behalf of a handshake before the session is Connected
#[async_trait]
pub(crate) trait HandshakeCaller: Send + Sync {
    async fn handshake_call(&self, request: Request, timeout: Duration) -> Result<Value, CallError>;
}

/// What a [`Handshake`] gets to work with
pub struct HandshakeContext<'a> {
    caller: &'a dyn HandshakeCaller,
    credentials: &'a Credentials,
    address: &'a str,
    call_timeout: Duration,
}

impl<'a> HandshakeContext<'a> {
    pub(crate) fn new(
        caller: &'a dyn HandshakeCaller,
        credentials: &'a Credentials,
        address: &'a str,
        call_timeout: Duration,
    ) -> Self {
        Self {
            caller,
            credentials,
            address,
            call_timeout,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        self.credentials
    }

    pub fn address(&self) -> &str {
        self.address
    }

    /// Issue a call over the link being established
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.caller
            .handshake_call(Request::with_params(method, params), self.call_timeout)
            .await
    }
}

/// Session establishment step run after the link opens
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    async fn perform(&self, ctx: &HandshakeContext<'_>) -> Result<(), ConnectError>;

    fn name(&self) -> &'static str {
        "handshake"
    }
}

/// Translate a failed handshake call into a connect error
pub fn connect_error_from_call(error: CallError) -> ConnectError {
    match error {
        CallError::Timeout { timeout, .. } => ConnectError::Timeout(timeout),
        CallError::Transport(reason) => ConnectError::Network(reason),
        CallError::Disconnected | CallError::NotConnected => {
            ConnectError::Network("link closed during handshake".to_string())
        }
        other => ConnectError::Protocol(other.to_string()),
    }
}

/// Devices that are ready as soon as the link is open
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn perform(&self, _ctx: &HandshakeContext<'_>) -> Result<(), ConnectError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Calls one method and requires a successful answer, e.g. a version query
#[derive(Debug, Clone)]
pub struct ProbeHandshake {
    method: String,
}

impl ProbeHandshake {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }
}

#[async_trait]
impl Handshake for ProbeHandshake {
    async fn perform(&self, ctx: &HandshakeContext<'_>) -> Result<(), ConnectError> {
        let answer = ctx
            .call(&self.method, Value::Null)
            .await
            .map_err(connect_error_from_call)?;
        tracing::debug!("{} answered {} with {}", ctx.address(), self.method, answer);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "probe"
    }
}

/// Username/password (or token) login
///
/// Remote errors whose code is listed in `auth_error_codes` mean the device
/// rejected the credentials and become [`ConnectError::Auth`].
#[derive(Debug, Clone)]
pub struct LoginHandshake {
    method: String,
    auth_error_codes: Vec<i64>,
}

impl LoginHandshake {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            auth_error_codes: vec![401, 403],
        }
    }

    pub fn with_auth_error_codes(mut self, codes: impl IntoIterator<Item = i64>) -> Self {
        self.auth_error_codes = codes.into_iter().collect();
        self
    }
}

#[async_trait]
impl Handshake for LoginHandshake {
    async fn perform(&self, ctx: &HandshakeContext<'_>) -> Result<(), ConnectError> {
        let credentials = ctx.credentials();
        let params = match (&credentials.username, &credentials.password, &credentials.token) {
            (_, _, Some(token)) => json!({ "token": token }),
            (Some(username), Some(password), None) => {
                json!({ "username": username, "password": password })
            }
            _ => {
                return Err(ConnectError::Auth(
                    "Device requires credentials but none were configured".to_string(),
                ))
            }
        };

        match ctx.call(&self.method, params).await {
            Ok(_) => Ok(()),
            Err(CallError::Remote(remote)) if self.auth_error_codes.contains(&remote.code) => {
                Err(ConnectError::Auth(remote.message))
            }
            Err(error) => Err(connect_error_from_call(error)),
        }
    }

    fn name(&self) -> &'static str {
        "login"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use session_codec::{CallId, RemoteError};

    struct ScriptedCaller {
        answer: Result<Value, CallError>,
        seen: Mutex<Vec<Request>>,
    }

    impl ScriptedCaller {
        fn answering(answer: Result<Value, CallError>) -> Self {
            Self {
                answer,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HandshakeCaller for ScriptedCaller {
        async fn handshake_call(&self, request: Request, _timeout: Duration) -> Result<Value, CallError> {
            self.seen.lock().push(request);
            self.answer.clone()
        }
    }

    fn context<'a>(caller: &'a ScriptedCaller, credentials: &'a Credentials) -> HandshakeContext<'a> {
        HandshakeContext::new(caller, credentials, "device:1", Duration::from_secs(1))
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials::basic("admin", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("admin"));
        assert!(!printed.contains("hunter2"));
        assert!(Credentials::none().is_empty());
    }

    #[tokio::test]
    async fn test_login_sends_credentials() {
        let caller = ScriptedCaller::answering(Ok(json!("OK")));
        let creds = Credentials::basic("admin", "secret");
        LoginHandshake::new("Session.Login")
            .perform(&context(&caller, &creds))
            .await
            .unwrap();

        let seen = caller.seen.lock();
        assert_eq!(seen[0].method, "Session.Login");
        assert_eq!(seen[0].params["username"], "admin");
    }

    #[tokio::test]
    async fn test_login_rejected_is_auth_error() {
        let caller = ScriptedCaller::answering(Err(CallError::Remote(RemoteError::new(401, "bad password"))));
        let creds = Credentials::basic("admin", "wrong");
        let error = LoginHandshake::new("Session.Login")
            .perform(&context(&caller, &creds))
            .await
            .unwrap_err();
        assert_eq!(error, ConnectError::Auth("bad password".to_string()));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_login_without_credentials() {
        let caller = ScriptedCaller::answering(Ok(Value::Null));
        let creds = Credentials::none();
        let error = LoginHandshake::new("Session.Login")
            .perform(&context(&caller, &creds))
            .await
            .unwrap_err();
        assert!(matches!(error, ConnectError::Auth(_)));
        assert!(caller.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_probe_timeout_is_retryable() {
        let caller = ScriptedCaller::answering(Err(CallError::Timeout {
            id: CallId::new(1),
            timeout: Duration::from_secs(1),
        }));
        let creds = Credentials::none();
        let error = ProbeHandshake::new("JSONRPC.Version")
            .perform(&context(&caller, &creds))
            .await
            .unwrap_err();
        assert_eq!(error, ConnectError::Timeout(Duration::from_secs(1)));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_connect_error_from_call() {
        assert!(matches!(
            connect_error_from_call(CallError::Disconnected),
            ConnectError::Network(_)
        ));
        assert!(matches!(
            connect_error_from_call(CallError::Remote(RemoteError::new(-32601, "nope"))),
            ConnectError::Protocol(_)
        ));
    }
}
