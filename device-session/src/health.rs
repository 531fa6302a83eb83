//! Liveness checks and periodic refreshes run by the scheduler

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use session_codec::Request;

use crate::error::CallError;
use crate::session::SessionManager;

/// Proves that a connected device still answers
#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    /// Run one check, giving up after `timeout`
    async fn check(&self, session: &SessionManager, timeout: Duration) -> Result<(), CallError>;
}

/// Health check that calls a cheap method, such as `JSONRPC.Ping`
#[derive(Debug, Clone)]
pub struct MethodHealthCheck {
    method: String,
    params: Value,
}

impl MethodHealthCheck {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

#[async_trait]
impl HealthCheck for MethodHealthCheck {
    async fn check(&self, session: &SessionManager, timeout: Duration) -> Result<(), CallError> {
        session
            .call(Request::with_params(&self.method, self.params.clone()), timeout)
            .await
            .map(|_| ())
    }
}

/// Refresh run after each successful health check, for devices whose state
/// is only learned by asking
#[async_trait]
pub trait PollAction: Send + Sync + 'static {
    async fn poll(&self, session: &SessionManager) -> Result<(), CallError>;
}
