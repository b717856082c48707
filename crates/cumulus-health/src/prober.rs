//! Readiness probing of compute resources.
//!
//! A compute is reachable once one of its interfaces is: interfaces with
//! no address or a private address count without a probe, any other
//! address must accept an SSH session and run `hostname` within the probe
//! timeout. Probe failures are logged and reported as "not yet reachable";
//! the caller decides how often to ask again.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

use cumulus_state::{ComputeId, ComputeResource};

use crate::session::{ProbeError, RemoteSession, SessionConnector, SessionOptions, SessionResult, SessionTarget};

/// Boxed future borrowing the session for the duration of an action.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Command run by a probe.
const PROBE_COMMAND: &str = "hostname";

/// Probes compute resources over [`SessionConnector`] sessions.
pub struct ReadinessProber {
    connector: Arc<dyn SessionConnector>,
    user: String,
    options: SessionOptions,
    timeout: Duration,
    /// compute id → address of the first reachable interface.
    reachable: Mutex<HashMap<ComputeId, Option<String>>>,
}

impl ReadinessProber {
    pub fn new(connector: Arc<dyn SessionConnector>, user: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            connector,
            user: user.into(),
            options,
            timeout: Duration::from_secs(10),
            reachable: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Open a session to `host`, run `action` on it and always close it.
    pub async fn run<T, F>(
        &self,
        host: &str,
        user: &str,
        options: &SessionOptions,
        action: F,
    ) -> SessionResult<T>
    where
        F: for<'a> FnOnce(&'a dyn RemoteSession) -> BoxFuture<'a, SessionResult<T>>,
    {
        self.run_within(host, user, options, None, action).await
    }

    /// [`run`](Self::run) with both the connect and the action bounded by
    /// `limit`. The session is closed even when the action times out.
    async fn run_within<T, F>(
        &self,
        host: &str,
        user: &str,
        options: &SessionOptions,
        limit: Option<Duration>,
        action: F,
    ) -> SessionResult<T>
    where
        F: for<'a> FnOnce(&'a dyn RemoteSession) -> BoxFuture<'a, SessionResult<T>>,
    {
        let target = SessionTarget::new(host, user, options.clone());
        let deadline = limit.map(|t| (Instant::now() + t, t));
        let session = match deadline {
            Some((at, t)) => timeout_at(at, self.connector.open(&target))
                .await
                .map_err(|_| ProbeError::Timeout(t))??,
            None => self.connector.open(&target).await?,
        };
        let result = match deadline {
            Some((at, t)) => match timeout_at(at, action(session.as_ref())).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(t)),
            },
            None => action(session.as_ref()).await,
        };
        session.close().await;
        result
    }

    /// Whether any interface of `compute` is reachable.
    ///
    /// Never fails and never retries. The first reachable interface is
    /// remembered for the compute, later calls return without probing.
    pub async fn is_reachable(&self, compute: &ComputeResource) -> bool {
        if compute.nic.is_empty() {
            return false;
        }
        if self.memoized(&compute.id).is_some() {
            return true;
        }
        for nic in &compute.nic {
            let found = match nic.ip.as_deref() {
                _ if nic.skips_probe() => true,
                Some(ip) => match self.probe(ip).await {
                    Ok(()) => true,
                    Err(e) => {
                        info!(compute = %compute.name, %ip, reason = %e, "can't ssh yet");
                        false
                    }
                },
                None => true,
            };
            if found {
                self.remember(&compute.id, nic.ip.clone());
                return true;
            }
        }
        false
    }

    /// Address of the first reachable interface, once known.
    pub fn reachable_address(&self, compute: &ComputeResource) -> Option<String> {
        self.memoized(&compute.id).flatten()
    }

    /// Drop the remembered address of a compute.
    pub fn forget(&self, compute: &ComputeResource) {
        if let Ok(mut memo) = self.reachable.lock() {
            memo.remove(&compute.id);
        }
    }

    fn memoized(&self, id: &str) -> Option<Option<String>> {
        self.reachable.lock().ok()?.get(id).cloned()
    }

    fn remember(&self, id: &str, ip: Option<String>) {
        if let Ok(mut memo) = self.reachable.lock() {
            memo.entry(id.to_string()).or_insert(ip);
        }
    }

    async fn probe(&self, ip: &str) -> SessionResult<()> {
        let output = self
            .run_within(ip, &self.user, &self.options, Some(self.timeout), |session| {
                Box::pin(async move { session.exec(PROBE_COMMAND).await })
            })
            .await?;
        debug!(%ip, hostname = %output.stdout.trim(), "probe succeeded");
        Ok(())
    }
}
