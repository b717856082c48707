//! cumulus.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CumulusConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub experiment: ExperimentConfig,
    pub fleet: FleetConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
}

/// Credentials and endpoint of the resource API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Bastion host every session is tunnelled through, if any.
    pub gateway: Option<String>,
    /// User on the gateway. Defaults to `api.username`.
    pub gateway_user: Option<String>,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub keys: Vec<String>,
    pub keys_only: Option<bool>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            gateway: None,
            gateway_user: None,
            user: default_ssh_user(),
            keys: Vec::new(),
            keys_only: None,
            port: default_ssh_port(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// Monitoring service (JSON-RPC) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_user")]
    pub username: String,
    /// Falls back to the experiment's `aggregator_password` when unset.
    pub password: Option<String>,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,
    #[serde(default = "default_lookback")]
    pub lookback: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            username: default_monitor_user(),
            password: None,
            retry_delay: default_retry_delay(),
            max_auth_retries: default_max_auth_retries(),
            lookback: default_lookback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_walltime")]
    pub walltime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_wan_network")]
    pub wan_network: String,
    pub aggregator: RoleConfig,
    pub server: RoleConfig,
    pub clients: ClientsConfig,
    pub private_network: Option<PrivateNetworkConfig>,
}

/// A single machine role (aggregator, server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub location: String,
    pub image: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    pub metric: Option<MetricRegistrationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsConfig {
    /// Candidate locations, in tie-break order.
    pub locations: Vec<String>,
    pub image: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default = "default_initial_clients")]
    pub initial: u32,
    pub metric: Option<MetricRegistrationConfig>,
}

/// A user parameter registered with the monitoring agent on boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRegistrationConfig {
    pub name: String,
    pub command: String,
}

/// Optional inter-VM network shared by the server and the clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateNetworkConfig {
    pub location: String,
    #[serde(default = "default_private_address")]
    pub address: String,
    #[serde(default = "default_private_size")]
    pub size: u32,
    #[serde(default = "default_bandwidth")]
    pub bandwidth: u32,
    #[serde(default)]
    pub latency: u32,
    #[serde(default)]
    pub lossrate: u32,
    #[serde(default = "default_private_server_ip")]
    pub server_ip: String,
    /// Host part of the first client address (`{prefix}.{offset + ordinal}`).
    #[serde(default = "default_client_offset")]
    pub client_offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Monitoring item key sampled on the server.
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_min_clients")]
    pub min_clients: usize,
    #[serde(default = "default_scale_up_below")]
    pub scale_up_below: f64,
    #[serde(default = "default_scale_down_above")]
    pub scale_down_above: f64,
    #[serde(default = "default_scale_up_samples")]
    pub scale_up_samples: usize,
    #[serde(default = "default_scale_down_samples")]
    pub scale_down_samples: usize,
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,
    #[serde(default = "default_tick")]
    pub tick_interval: String,
    #[serde(default = "default_terminating_tick")]
    pub terminating_interval: String,
    #[serde(default = "default_tick")]
    pub idle_interval: String,
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll: String,
    #[serde(default = "default_setup_poll")]
    pub setup_poll: String,
    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace: String,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            max_clients: default_max_clients(),
            min_clients: default_min_clients(),
            scale_up_below: default_scale_up_below(),
            scale_down_above: default_scale_down_above(),
            scale_up_samples: default_scale_up_samples(),
            scale_down_samples: default_scale_down_samples(),
            sample_window: default_sample_window(),
            tick_interval: default_tick(),
            terminating_interval: default_terminating_tick(),
            idle_interval: default_tick(),
            readiness_poll: default_readiness_poll(),
            setup_poll: default_setup_poll(),
            cleanup_grace: default_cleanup_grace(),
        }
    }
}

/// Resolved intervals of the control loop and failure handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub tick: Duration,
    pub terminating: Duration,
    pub idle: Duration,
    pub readiness_poll: Duration,
    pub setup_poll: Duration,
    pub cleanup_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            terminating: Duration::from_secs(30),
            idle: Duration::from_secs(60),
            readiness_poll: Duration::from_secs(10),
            setup_poll: Duration::from_secs(20),
            cleanup_grace: Duration::from_secs(30),
        }
    }
}

impl ScalingConfig {
    pub fn timings(&self) -> anyhow::Result<Timings> {
        Ok(Timings {
            tick: duration_field("scaling.tick_interval", &self.tick_interval)?,
            terminating: duration_field("scaling.terminating_interval", &self.terminating_interval)?,
            idle: duration_field("scaling.idle_interval", &self.idle_interval)?,
            readiness_poll: duration_field("scaling.readiness_poll", &self.readiness_poll)?,
            setup_poll: duration_field("scaling.setup_poll", &self.setup_poll)?,
            cleanup_grace: duration_field("scaling.cleanup_grace", &self.cleanup_grace)?,
        })
    }
}

impl SshConfig {
    pub fn probe_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("ssh.probe_timeout", &self.probe_timeout)
    }

    /// Keys-only authentication is implied when keys are configured.
    pub fn keys_only(&self) -> bool {
        self.keys_only.unwrap_or(!self.keys.is_empty())
    }
}

impl MonitorConfig {
    pub fn retry_delay(&self) -> anyhow::Result<Duration> {
        duration_field("monitor.retry_delay", &self.retry_delay)
    }

    pub fn lookback(&self) -> anyhow::Result<Duration> {
        duration_field("monitor.lookback", &self.lookback)
    }
}

impl ExperimentConfig {
    pub fn walltime(&self) -> anyhow::Result<Duration> {
        duration_field("experiment.walltime", &self.walltime)
    }
}

impl CumulusConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: CumulusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the control loop cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.experiment.name.trim().is_empty() {
            bail!("experiment.name must not be empty");
        }
        if self.fleet.clients.locations.is_empty() {
            bail!("fleet.clients.locations must list at least one location");
        }
        let s = &self.scaling;
        if s.scale_up_samples == 0 || s.scale_down_samples == 0 {
            bail!("scaling sample counts must be positive");
        }
        if s.sample_window < s.scale_up_samples.max(s.scale_down_samples) {
            bail!(
                "scaling.sample_window ({}) is smaller than the largest averaging window",
                s.sample_window
            );
        }
        if s.scale_up_below >= s.scale_down_above {
            bail!(
                "scaling.scale_up_below ({}) must be below scaling.scale_down_above ({})",
                s.scale_up_below,
                s.scale_down_above
            );
        }
        s.timings()?;
        self.ssh.probe_timeout()?;
        self.monitor.retry_delay()?;
        self.monitor.lookback()?;
        self.experiment.walltime()?;
        Ok(())
    }
}

fn duration_field(field: &str, value: &str) -> anyhow::Result<Duration> {
    match parse_duration(value) {
        Some(d) => Ok(d),
        None => bail!("{field}: invalid duration {value:?}"),
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_probe_timeout() -> String {
    "10s".to_string()
}

fn default_monitor_user() -> String {
    "Admin".to_string()
}

fn default_retry_delay() -> String {
    "5s".to_string()
}

fn default_max_auth_retries() -> u32 {
    3
}

fn default_lookback() -> String {
    "1h".to_string()
}

fn default_walltime() -> String {
    "8h".to_string()
}

fn default_wan_network() -> String {
    "BonFIRE WAN".to_string()
}

fn default_instance_type() -> String {
    "small".to_string()
}

fn default_initial_clients() -> u32 {
    2
}

fn default_private_address() -> String {
    "192.168.0.0".to_string()
}

fn default_private_size() -> u32 {
    24
}

fn default_bandwidth() -> u32 {
    1000
}

fn default_private_server_ip() -> String {
    "192.168.0.2".to_string()
}

fn default_client_offset() -> u32 {
    3
}

fn default_metric() -> String {
    "system.cpu.util[,system,avg1]".to_string()
}

fn default_max_clients() -> usize {
    10
}

fn default_min_clients() -> usize {
    1
}

fn default_scale_up_below() -> f64 {
    20.0
}

fn default_scale_down_above() -> f64 {
    22.0
}

fn default_scale_up_samples() -> usize {
    3
}

fn default_scale_down_samples() -> usize {
    5
}

fn default_sample_window() -> usize {
    6
}

fn default_tick() -> String {
    "60s".to_string()
}

fn default_terminating_tick() -> String {
    "30s".to_string()
}

fn default_readiness_poll() -> String {
    "10s".to_string()
}

fn default_setup_poll() -> String {
    "20s".to_string()
}

fn default_cleanup_grace() -> String {
    "30s".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[api]
base_url = "https://api.example.org"
username = "alice"
password = "secret"

[experiment]
name = "Demo ONE"

[fleet.aggregator]
location = "fr-inria"
image = "Zabbix Aggregator v4"

[fleet.server]
location = "de-hlrs"
image = "VM-iperf"

[fleet.clients]
locations = ["uk-epcc", "de-hlrs", "fr-inria"]
image = "VM-iperf"
"#;

    #[test]
    fn parse_minimal_applies_defaults() {
        let config = CumulusConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.experiment.name, "Demo ONE");
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.monitor.username, "Admin");
        assert_eq!(config.monitor.max_auth_retries, 3);
        assert_eq!(config.fleet.wan_network, "BonFIRE WAN");
        assert_eq!(config.fleet.clients.initial, 2);
        assert_eq!(config.fleet.clients.instance_type, "small");
        assert!(config.fleet.private_network.is_none());
        assert_eq!(config.scaling.max_clients, 10);
        assert_eq!(config.scaling.min_clients, 1);
        assert_eq!(config.scaling.timings().unwrap(), Timings::default());
        assert_eq!(config.ssh.probe_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.monitor.retry_delay().unwrap(), Duration::from_secs(5));
        assert_eq!(config.experiment.walltime().unwrap(), Duration::from_secs(8 * 3600));
    }

    #[test]
    fn keys_only_follows_configured_keys() {
        let mut ssh = SshConfig::default();
        assert!(!ssh.keys_only());
        ssh.keys.push("~/.ssh/id_rsa".to_string());
        assert!(ssh.keys_only());
        ssh.keys_only = Some(false);
        assert!(!ssh.keys_only());
    }

    #[test]
    fn private_network_defaults() {
        let toml_str = format!(
            "{MINIMAL}\n[fleet.private_network]\nlocation = \"be-ibbt\"\n"
        );
        let config = CumulusConfig::from_toml(&toml_str).unwrap();
        let net = config.fleet.private_network.unwrap();
        assert_eq!(net.address, "192.168.0.0");
        assert_eq!(net.size, 24);
        assert_eq!(net.server_ip, "192.168.0.2");
        assert_eq!(net.client_offset, 3);
    }

    #[test]
    fn rejects_empty_client_locations() {
        let toml_str = MINIMAL.replace(
            r#"locations = ["uk-epcc", "de-hlrs", "fr-inria"]"#,
            "locations = []",
        );
        let err = CumulusConfig::from_toml(&toml_str).unwrap_err();
        assert!(err.to_string().contains("fleet.clients.locations"));
    }

    #[test]
    fn rejects_bad_duration() {
        let toml_str = format!("{MINIMAL}\n[scaling]\ntick_interval = \"often\"\n");
        let err = CumulusConfig::from_toml(&toml_str).unwrap_err();
        assert!(err.to_string().contains("scaling.tick_interval"));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let toml_str =
            format!("{MINIMAL}\n[scaling]\nscale_up_below = 30.0\nscale_down_above = 22.0\n");
        assert!(CumulusConfig::from_toml(&toml_str).is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = CumulusConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let again = CumulusConfig::from_toml(&rendered).unwrap();
        assert_eq!(again.fleet.clients.locations, config.fleet.clients.locations);
    }
}
