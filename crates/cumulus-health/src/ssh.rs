//! SSH sessions over russh, optionally tunnelled through a gateway.
//!
//! With a gateway configured, the connector first authenticates to the
//! gateway, opens a `direct-tcpip` channel to the target's SSH port and
//! runs a second SSH handshake over that channel. Closing the session
//! disconnects the target first, then the gateway.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use tracing::{debug, info};

use crate::session::{
    CommandOutput, ProbeError, RemoteSession, SessionConnector, SessionOptions, SessionResult,
    SessionTarget,
};

/// Identities tried when the caller does not restrict keys.
const DEFAULT_IDENTITIES: [&str; 3] = ["~/.ssh/id_ed25519", "~/.ssh/id_rsa", "~/.ssh/id_ecdsa"];

/// Gateway ("bastion") settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
}

/// Host keys are accepted without verification.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = ProbeError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connector that opens real SSH sessions.
pub struct SshConnector {
    gateway: Option<GatewayConfig>,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(gateway: Option<GatewayConfig>) -> Self {
        Self {
            gateway,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn client_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        })
    }

    async fn connect_direct(
        &self,
        host: &str,
        port: u16,
    ) -> SessionResult<Handle<AcceptingHandler>> {
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(
            self.connect_timeout,
            client::connect(Self::client_config(), addr.as_str(), AcceptingHandler),
        )
        .await
        {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(ProbeError::ConnectionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ProbeError::Timeout(self.connect_timeout)),
        }
    }

    async fn connect_through(
        &self,
        gateway: &Handle<AcceptingHandler>,
        gateway_host: &str,
        host: &str,
        port: u16,
    ) -> SessionResult<Handle<AcceptingHandler>> {
        let tunnel_err = |reason: String| ProbeError::Tunnel {
            gateway: gateway_host.to_string(),
            host: host.to_string(),
            reason,
        };
        let channel = gateway
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| tunnel_err(e.to_string()))?;
        let stream = channel.into_stream();
        match tokio::time::timeout(
            self.connect_timeout,
            client::connect_stream(Self::client_config(), stream, AcceptingHandler),
        )
        .await
        {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(tunnel_err(e.to_string())),
            Err(_) => Err(ProbeError::Timeout(self.connect_timeout)),
        }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn open(&self, target: &SessionTarget) -> SessionResult<Box<dyn RemoteSession>> {
        info!(user = %target.user, host = %target.host, "trying to ssh");
        let Some(gw) = &self.gateway else {
            let mut handle = self.connect_direct(&target.host, target.options.port).await?;
            authenticate(&mut handle, &target.user, &target.host, &target.options).await?;
            return Ok(Box::new(SshSession {
                target: handle,
                gateway: None,
            }));
        };

        debug!(gateway = %gw.host, host = %target.host, "opening gateway tunnel");
        let mut gateway = self.connect_direct(&gw.host, gw.port).await?;
        authenticate(&mut gateway, &gw.user, &gw.host, &target.options).await?;

        let opened = async {
            let mut handle = self
                .connect_through(&gateway, &gw.host, &target.host, target.options.port)
                .await?;
            authenticate(&mut handle, &target.user, &target.host, &target.options).await?;
            Ok::<_, ProbeError>(handle)
        }
        .await;

        match opened {
            Ok(handle) => Ok(Box::new(SshSession {
                target: handle,
                gateway: Some(gateway),
            })),
            Err(e) => {
                disconnect(&gateway).await;
                Err(e)
            }
        }
    }
}

/// Offer each candidate key in turn until one is accepted.
async fn authenticate(
    handle: &mut Handle<AcceptingHandler>,
    user: &str,
    host: &str,
    options: &SessionOptions,
) -> SessionResult<()> {
    for path in candidate_keys(options) {
        let key = match russh_keys::load_secret_key(&path, None) {
            Ok(key) => key,
            Err(e) => {
                debug!(key = %path.display(), error = %e, "skipping key");
                continue;
            }
        };
        if handle.authenticate_publickey(user, Arc::new(key)).await? {
            return Ok(());
        }
    }
    Err(ProbeError::AuthFailed {
        user: user.to_string(),
        host: host.to_string(),
    })
}

fn candidate_keys(options: &SessionOptions) -> Vec<PathBuf> {
    let mut keys: Vec<PathBuf> = options.keys.iter().map(|k| expand_tilde(k)).collect();
    if !options.keys_only {
        for default in DEFAULT_IDENTITIES {
            let path = expand_tilde(Path::new(default));
            if !keys.contains(&path) {
                keys.push(path);
            }
        }
    }
    keys
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

async fn disconnect(handle: &Handle<AcceptingHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(error = %e, "disconnect failed");
    }
}

struct SshSession {
    target: Handle<AcceptingHandler>,
    gateway: Option<Handle<AcceptingHandler>>,
}

/// Drain a channel until EOF or close, collecting output and exit status.
async fn collect(channel: &mut russh::Channel<client::Msg>) -> CommandOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                stderr.extend_from_slice(&data)
            }
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
            _ => {}
        }
    }
    CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: exit_code.unwrap_or(0),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> SessionResult<CommandOutput> {
        debug!(%command, "executing command");
        let mut channel = self
            .target
            .channel_open_session()
            .await
            .map_err(|e| ProbeError::Channel(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ProbeError::Channel(e.to_string()))?;
        Ok(collect(&mut channel).await)
    }

    async fn upload(&self, contents: &[u8], remote_path: &str) -> SessionResult<()> {
        debug!(%remote_path, bytes = contents.len(), "uploading");
        let mut channel = self
            .target
            .channel_open_session()
            .await
            .map_err(|e| ProbeError::Channel(e.to_string()))?;
        let command = format!("cat > '{}'", escape_path(remote_path));
        channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| ProbeError::Channel(e.to_string()))?;
        channel
            .data(contents)
            .await
            .map_err(|e| ProbeError::Channel(e.to_string()))?;
        channel
            .eof()
            .await
            .map_err(|e| ProbeError::Channel(e.to_string()))?;
        let output = collect(&mut channel).await;
        if !output.success() {
            return Err(ProbeError::CommandFailed {
                code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn close(&self) {
        disconnect(&self.target).await;
        if let Some(gateway) = &self.gateway {
            disconnect(gateway).await;
        }
    }
}

/// Escape a path for a single-quoted shell word.
fn escape_path(path: &str) -> String {
    path.replace('\'', "'\\''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_only_restricts_candidates() {
        let options = SessionOptions {
            port: 22,
            keys: vec![PathBuf::from("/keys/experiment")],
            keys_only: true,
        };
        assert_eq!(candidate_keys(&options), vec![PathBuf::from("/keys/experiment")]);
    }

    #[test]
    fn default_identities_follow_configured_keys() {
        let options = SessionOptions {
            port: 22,
            keys: vec![PathBuf::from("/keys/experiment")],
            keys_only: false,
        };
        let keys = candidate_keys(&options);
        assert_eq!(keys.len(), 1 + DEFAULT_IDENTITIES.len());
        assert_eq!(keys[0], PathBuf::from("/keys/experiment"));
    }

    #[test]
    fn tilde_expansion_leaves_absolute_paths() {
        assert_eq!(expand_tilde(Path::new("/etc/key")), PathBuf::from("/etc/key"));
    }

    #[test]
    fn escape_single_quotes() {
        assert_eq!(escape_path("/tmp/it's.log"), "/tmp/it'\\''s.log");
        assert_eq!(escape_path("/tmp/file.log"), "/tmp/file.log");
    }
}
