//! Wiring of the external collaborators: repository, SSH, monitoring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::watch;
use tracing::info;

use cumulus_core::CumulusConfig;
use cumulus_health::{GatewayConfig, ReadinessProber, SessionOptions, SshConnector};
use cumulus_metrics::{HttpTransport, MonitorClient, RpcTransport};
use cumulus_state::{Experiment, HttpRepository, SharedRepository, StateStore};

use crate::sim;

/// The repository a run talks to, and whether it is simulated.
pub struct Backend {
    pub repo: SharedRepository,
    pub simulated: bool,
}

impl Backend {
    pub async fn open(config: &CumulusConfig, simulate: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = simulate else {
            let repo = HttpRepository::new(
                &config.api.base_url,
                &config.api.username,
                &config.api.password,
            )?;
            info!(base_url = %repo.base_url(), "using resource API");
            return Ok(Self {
                repo: Arc::new(repo),
                simulated: false,
            });
        };

        let store = StateStore::open(path)
            .with_context(|| format!("opening simulated repository {}", path.display()))?;
        sim::seed(&store, config).await?;
        info!(path = %path.display(), "using simulated repository");
        Ok(Self {
            repo: Arc::new(store),
            simulated: true,
        })
    }

    /// Prober with the configured SSH user, keys and gateway.
    pub fn prober(&self, config: &CumulusConfig) -> anyhow::Result<ReadinessProber> {
        let ssh = &config.ssh;
        let timeout = ssh.probe_timeout()?;
        let gateway = ssh.gateway.as_ref().map(|host| GatewayConfig {
            host: host.clone(),
            user: ssh
                .gateway_user
                .clone()
                .unwrap_or_else(|| config.api.username.clone()),
            port: ssh.port,
        });
        let options = SessionOptions {
            port: ssh.port,
            keys: ssh.keys.iter().map(PathBuf::from).collect(),
            keys_only: ssh.keys_only(),
        };
        let connector = SshConnector::new(gateway).with_connect_timeout(timeout);
        Ok(ReadinessProber::new(Arc::new(connector), &ssh.user, options).with_timeout(timeout))
    }

    /// Monitoring client for `experiment`. Transport retries stop once
    /// `cancel` turns true.
    pub fn monitor(
        &self,
        config: &CumulusConfig,
        experiment: &Experiment,
        cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<MonitorClient> {
        let password = match (&config.monitor.password, &experiment.aggregator_password) {
            (Some(p), _) | (None, Some(p)) => p.clone(),
            (None, None) if self.simulated => String::new(),
            (None, None) => bail!(
                "no monitoring password: set monitor.password or provide the experiment's aggregator password"
            ),
        };
        let transport: Arc<dyn RpcTransport> = if self.simulated {
            Arc::new(sim::SimulatedMonitor::default())
        } else {
            let http = HttpTransport::for_experiment(
                &config.api.base_url,
                &experiment.id,
                &config.api.username,
                &config.api.password,
            )?;
            info!(url = %http.url(), "monitoring endpoint");
            Arc::new(http)
        };
        Ok(MonitorClient::new(transport, &config.monitor.username, password)
            .with_retry_delay(config.monitor.retry_delay()?)
            .with_max_auth_retries(config.monitor.max_auth_retries)
            .with_lookback(config.monitor.lookback()?)
            .with_cancellation(cancel))
    }
}
