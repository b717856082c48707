//! Remote command sessions.
//!
//! The prober only needs to open a session to `user@host`, run commands
//! and optionally push a file. [`SessionConnector`] is the seam between
//! the prober and the SSH implementation in [`crate::ssh`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, ProbeError>;

/// Errors raised while opening or using a remote session.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },

    #[error("gateway {gateway} could not reach {host}: {reason}")]
    Tunnel {
        gateway: String,
        host: String,
        reason: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("key loading failed: {0}")]
    Key(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("command failed with exit code {code}: {stderr}")]
    CommandFailed { code: u32, stderr: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Per-session connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub port: u16,
    /// Private keys to offer, in order.
    pub keys: Vec<PathBuf>,
    /// Offer only `keys`, never the default `~/.ssh` identities.
    pub keys_only: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            port: 22,
            keys: Vec::new(),
            keys_only: false,
        }
    }
}

/// Where a session goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub user: String,
    pub options: SessionOptions,
}

impl SessionTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            options,
        }
    }
}

/// An open session on a remote machine.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn exec(&self, command: &str) -> SessionResult<CommandOutput>;

    /// Write `contents` to `remote_path` on the machine.
    async fn upload(&self, contents: &[u8], remote_path: &str) -> SessionResult<()>;

    /// Tear the session down, including any gateway tunnel.
    async fn close(&self);
}

/// Opens sessions, directly or through a gateway.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(&self, target: &SessionTarget) -> SessionResult<Box<dyn RemoteSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_port_22() {
        let opts = SessionOptions::default();
        assert_eq!(opts.port, 22);
        assert!(opts.keys.is_empty());
        assert!(!opts.keys_only);
    }

    #[test]
    fn command_output_success() {
        let ok = CommandOutput {
            stdout: "vm-1\n".to_string(),
            ..Default::default()
        };
        assert!(ok.success());
        let failed = CommandOutput {
            exit_code: 127,
            ..Default::default()
        };
        assert!(!failed.success());
    }

    #[test]
    fn error_messages_name_the_host() {
        let err = ProbeError::ConnectionFailed {
            host: "172.18.0.2".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "connection to 172.18.0.2 failed: refused");
    }
}
