//! Monitoring client error types.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Error payload returned by the monitoring service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl RpcError {
    /// The service's way of saying the token is missing or stale.
    pub fn is_not_authorized(&self) -> bool {
        self.data.as_str() == Some("Not authorized")
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        match &self.data {
            Value::Null => Ok(()),
            Value::String(s) => write!(f, ": {s}"),
            other => write!(f, ": {other}"),
        }
    }
}

/// Transport-level failures. `request` retries these until it gets a body
/// or is cancelled, so they never reach a [`MonitorError`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("monitoring endpoint returned {status}")]
    Status { status: u16 },
}

/// Errors that can occur while talking to the monitoring service.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("authentication as {user} failed: {error}")]
    AuthenticationFailed { user: String, error: RpcError },

    #[error("{method} still not authorized after {attempts} re-authentications")]
    AuthRejected { method: String, attempts: u32 },

    #[error("{method} failed: {error}")]
    Rpc { method: String, error: RpcError },

    #[error("invalid response to {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("cancelled while retrying {method}")]
    Cancelled { method: String },
}

pub type MonitorResult<T> = Result<T, MonitorError>;
