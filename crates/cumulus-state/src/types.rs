//! Domain types for experiments and their resources.
//!
//! These mirror the wire shape of the resource API. All types are
//! serializable to/from JSON, both for the REST repository and for the
//! redb tables of the simulated store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Identifier of an experiment.
pub type ExperimentId = String;

/// Identifier of a compute resource.
pub type ComputeId = String;

/// Identifier of a location.
pub type LocationId = String;

/// Identifier of a network.
pub type NetworkId = String;

/// Identifier of a storage (disk image).
pub type StorageId = String;

// ── Experiment ────────────────────────────────────────────────────

/// The top-level unit of resource ownership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ExperimentStatus,
    /// Walltime budget in seconds.
    pub walltime: u64,
    /// Password of the monitoring aggregator provisioned for this experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_password: Option<String>,
    /// Unix timestamp (seconds) when the experiment was submitted.
    #[serde(default)]
    pub created_at: u64,
}

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Waiting,
    Running,
    Terminating,
    Terminated,
    Canceled,
}

impl ExperimentStatus {
    /// Terminal statuses end the control loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExperimentStatus::Terminated | ExperimentStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentStatus::Waiting => "waiting",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Terminating => "terminating",
            ExperimentStatus::Terminated => "terminated",
            ExperimentStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for submitting a new experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSpec {
    pub name: String,
    pub description: String,
    pub status: ExperimentStatus,
    /// Walltime budget in seconds.
    pub walltime: u64,
}

// ── Reference data ────────────────────────────────────────────────

/// A cloud site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
}

/// A disk image available at a location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Storage {
    pub id: StorageId,
    pub name: String,
    pub location: LocationId,
}

/// A network available at a location, or created for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
    pub location: LocationId,
    /// Base address of the network block, when the site exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Owning experiment for experiment-scoped networks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<ExperimentId>,
}

/// Parameters for an experiment-scoped network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    pub location: LocationId,
    pub address: String,
    /// Prefix length of the block.
    pub size: u32,
    pub bandwidth: u32,
    pub latency: u32,
    pub lossrate: u32,
}

// ── Compute ───────────────────────────────────────────────────────

/// A provisioned virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeResource {
    pub id: ComputeId,
    pub name: String,
    pub state: ComputeState,
    #[serde(default)]
    pub nic: Vec<Nic>,
    #[serde(default)]
    pub disk: Vec<Disk>,
    pub location: LocationId,
    pub experiment: ExperimentId,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub context: BTreeMap<String, ContextValue>,
}

impl ComputeResource {
    /// Address of the first interface, as logged and handed to peers.
    pub fn primary_ip(&self) -> Option<&str> {
        self.nic.first().and_then(|n| n.ip.as_deref())
    }

    pub fn is_active(&self) -> bool {
        self.state == ComputeState::Active
    }

    pub fn is_failed(&self) -> bool {
        self.state == ComputeState::Failed
    }
}

/// Remote state of a compute resource.
///
/// States the API reports beyond the listed ones (`HOLD`, `SHUTDOWN`, ...)
/// decode as [`ComputeState::Unknown`] and are waited on like `PENDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComputeState {
    Pending,
    Prolog,
    Boot,
    Active,
    Failed,
    Done,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ComputeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComputeState::Pending => "PENDING",
            ComputeState::Prolog => "PROLOG",
            ComputeState::Boot => "BOOT",
            ComputeState::Active => "ACTIVE",
            ComputeState::Failed => "FAILED",
            ComputeState::Done => "DONE",
            ComputeState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A network interface attached to a compute resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Nic {
    pub ip: Option<String>,
    pub network: NetworkId,
}

impl Nic {
    /// Interfaces without an address, or on the private block, are never probed.
    pub fn skips_probe(&self) -> bool {
        match self.ip.as_deref() {
            None => true,
            Some(ip) => is_private_address(ip),
        }
    }
}

/// Whether `ip` lies in the private inter-VM block (192.168.0.0/16).
pub fn is_private_address(ip: &str) -> bool {
    match ip.trim().parse::<Ipv4Addr>() {
        Ok(addr) => {
            let [a, b, _, _] = addr.octets();
            a == 192 && b == 168
        }
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disk {
    pub storage: StorageId,
    #[serde(rename = "type")]
    pub kind: DiskKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskKind {
    Os,
    Data,
}

/// A value in the compute's context ("user data") map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ContextValue {
    Text(String),
    /// Embedded blob passed through verbatim (character data).
    Blob { cdata: String },
}

impl ContextValue {
    pub fn as_str(&self) -> &str {
        match self {
            ContextValue::Text(s) => s,
            ContextValue::Blob { cdata } => cdata,
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Text(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Text(s)
    }
}

/// Reserved context keys.
pub mod context_keys {
    pub const AGGREGATOR_IP: &str = "aggregator_ip";
    pub const IPERF_SERVER: &str = "iperf_server";
    pub const METRICS: &str = "metrics";
    pub const PRIVATE_NETWORK: &str = "private_network";
}

/// Build the monitoring-agent registration blob for the `metrics` key.
pub fn metric_registration(name: &str, command: &str) -> ContextValue {
    ContextValue::Blob {
        cdata: format!("<metric>{name},{command}</metric>"),
    }
}

/// Parameters for submitting a compute resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeSpec {
    pub name: String,
    pub instance_type: String,
    pub disk: Vec<DiskSpec>,
    pub nic: Vec<NicSpec>,
    pub location: LocationId,
    #[serde(default)]
    pub context: BTreeMap<String, ContextValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskSpec {
    pub storage: StorageId,
    #[serde(rename = "type")]
    pub kind: DiskKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NicSpec {
    pub network: NetworkId,
    /// Fixed address on networks that require one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl Experiment {
    /// Build the key for the experiments table.
    pub fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl ComputeResource {
    /// Build the composite key for the computes table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.experiment, self.id)
    }
}
