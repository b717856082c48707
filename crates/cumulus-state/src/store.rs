//! StateStore — redb-backed simulated resource provider.
//!
//! Implements [`ResourceRepository`] over local tables so a whole scenario
//! can run without a real cloud. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Simulation rules:
//! - identifiers come from monotonic counters in the `sequences` table
//! - computes start `PENDING` and, with [`Activation::OnReload`], turn
//!   `ACTIVE` on their first reload
//! - interfaces on networks with a known base address get the next address
//!   of that block, others stay unaddressed
//! - a running experiment whose walltime has elapsed reads back as
//!   `terminated`
//! - deleting an experiment deletes its computes and networks

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::repository::{ComputeQuery, ComputeScope, ExperimentQuery, ResourceRepository};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// How simulated computes leave `PENDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// The first reload of a pending compute reports it `ACTIVE`.
    #[default]
    OnReload,
    /// Computes stay where they are until [`StateStore::set_compute_state`].
    Manual,
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn system_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Thread-safe simulated provider backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    activation: Activation,
    clock: Clock,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            activation: Activation::default(),
            clock: Arc::new(system_clock),
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Replace the wall clock (unix seconds) used for walltime expiry.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(EXPERIMENTS).map_err(map_err!(Table))?;
        txn.open_table(COMPUTES).map_err(map_err!(Table))?;
        txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(STORAGES).map_err(map_err!(Table))?;
        txn.open_table(NETWORKS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Table helpers ──────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        insert(&txn, table, key, value)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`.
    fn scan<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Seeding ────────────────────────────────────────────────────

    /// Register a site. The location id is its name.
    pub fn seed_location(&self, name: &str) -> StateResult<Location> {
        let location = Location {
            id: name.to_string(),
            name: name.to_string(),
        };
        self.put(LOCATIONS, &location.id, &location)?;
        debug!(location = %name, "location seeded");
        Ok(location)
    }

    /// Register a disk image at a location.
    pub fn seed_storage(&self, location: &str, name: &str) -> StateResult<Storage> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = next_sequence(&txn, "storage")?.to_string();
        let storage = Storage {
            id: id.clone(),
            name: name.to_string(),
            location: location.to_string(),
        };
        insert(&txn, STORAGES, &format!("{location}:{id}"), &storage)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(storage)
    }

    /// Register a site network. With a base `address`, interfaces on it get
    /// addresses from that block.
    pub fn seed_network(
        &self,
        location: &str,
        name: &str,
        address: Option<&str>,
    ) -> StateResult<Network> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = next_sequence(&txn, "network")?.to_string();
        let network = Network {
            id: id.clone(),
            name: name.to_string(),
            location: location.to_string(),
            address: address.map(str::to_string),
            experiment: None,
        };
        insert(&txn, NETWORKS, &format!("{location}:{id}"), &network)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(network)
    }

    // ── Direct access ──────────────────────────────────────────────

    pub fn get_experiment(&self, id: &str) -> StateResult<Option<Experiment>> {
        self.get(EXPERIMENTS, id)
    }

    pub fn list_experiments(&self) -> StateResult<Vec<Experiment>> {
        self.scan(EXPERIMENTS, "")
    }

    pub fn list_computes(&self) -> StateResult<Vec<ComputeResource>> {
        self.scan(COMPUTES, "")
    }

    /// Force a compute into `state`, e.g. to simulate a boot failure.
    pub fn set_compute_state(
        &self,
        compute: &ComputeResource,
        state: ComputeState,
    ) -> StateResult<ComputeResource> {
        let key = compute.table_key();
        let mut stored: ComputeResource = self
            .get(COMPUTES, &key)?
            .ok_or_else(|| StateError::NotFound(format!("compute {}", compute.id)))?;
        stored.state = state;
        self.put(COMPUTES, &key, &stored)?;
        debug!(compute = %stored.name, %state, "compute state forced");
        Ok(stored)
    }

    fn all_networks(&self) -> StateResult<Vec<Network>> {
        self.scan(NETWORKS, "")
    }

    /// Pick addresses for the requested interfaces inside `txn`.
    fn attach_nics(&self, txn: &WriteTransaction, specs: &[NicSpec]) -> StateResult<Vec<Nic>> {
        let networks = self.all_networks()?;
        let mut nics = Vec::with_capacity(specs.len());
        for spec in specs {
            let network = networks
                .iter()
                .find(|n| n.id == spec.network)
                .ok_or_else(|| StateError::NotFound(format!("network {}", spec.network)))?;
            let ip = match (&spec.ip, &network.address) {
                (Some(ip), _) => Some(ip.clone()),
                (None, Some(base)) => {
                    let offset = next_sequence(txn, &format!("ip:{}", network.id))?;
                    allocate_address(base, offset)
                }
                (None, None) => None,
            };
            nics.push(Nic {
                ip,
                network: network.id.clone(),
            });
        }
        Ok(nics)
    }
}

fn insert<T: Serialize>(
    txn: &WriteTransaction,
    table: JsonTable,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Bump and return the named counter. The first value is 1.
fn next_sequence(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

/// Host `offset` of the block starting at `base`, skipping the gateway (.1).
fn allocate_address(base: &str, offset: u64) -> Option<String> {
    let base: Ipv4Addr = base.parse().ok()?;
    let host = u32::from(base).checked_add(u32::try_from(offset).ok()?.checked_add(1)?)?;
    Some(Ipv4Addr::from(host).to_string())
}

#[async_trait]
impl ResourceRepository for StateStore {
    async fn find_experiments(&self, query: &ExperimentQuery) -> StateResult<Vec<Experiment>> {
        let mut found = Vec::new();
        for experiment in self.list_experiments()? {
            if query.matches(&experiment) {
                found.push(experiment);
            }
        }
        Ok(found)
    }

    async fn submit_experiment(&self, spec: &ExperimentSpec) -> StateResult<Experiment> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = next_sequence(&txn, "experiment")?.to_string();
        let experiment = Experiment {
            id: id.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            status: spec.status,
            walltime: spec.walltime,
            aggregator_password: None,
            created_at: (self.clock)(),
        };
        insert(&txn, EXPERIMENTS, &experiment.table_key(), &experiment)?;
        txn.commit().map_err(map_err!(Transaction))?;
        info!(experiment = %id, name = %spec.name, status = %spec.status, "experiment submitted");
        Ok(experiment)
    }

    async fn reload_experiment(&self, id: &str) -> StateResult<Experiment> {
        let mut experiment = self
            .get_experiment(id)?
            .ok_or_else(|| StateError::NotFound(format!("experiment {id}")))?;
        let deadline = experiment.created_at.saturating_add(experiment.walltime);
        if experiment.status == ExperimentStatus::Running
            && experiment.walltime > 0
            && (self.clock)() >= deadline
        {
            experiment.status = ExperimentStatus::Terminated;
            self.put(EXPERIMENTS, &experiment.table_key(), &experiment)?;
            info!(experiment = %id, "walltime elapsed, experiment terminated");
        }
        Ok(experiment)
    }

    async fn update_experiment_status(
        &self,
        id: &str,
        status: ExperimentStatus,
    ) -> StateResult<Experiment> {
        let mut experiment = self
            .get_experiment(id)?
            .ok_or_else(|| StateError::NotFound(format!("experiment {id}")))?;
        experiment.status = status;
        self.put(EXPERIMENTS, &experiment.table_key(), &experiment)?;
        debug!(experiment = %id, %status, "experiment status updated");
        Ok(experiment)
    }

    async fn delete_experiment(&self, id: &str) -> StateResult<bool> {
        let compute_prefix = format!("{id}:");
        let compute_keys: Vec<String> = self
            .scan::<ComputeResource>(COMPUTES, &compute_prefix)?
            .iter()
            .map(ComputeResource::table_key)
            .collect();
        let network_keys: Vec<String> = self
            .all_networks()?
            .into_iter()
            .filter(|n| n.experiment.as_deref() == Some(id))
            .map(|n| format!("{}:{}", n.location, n.id))
            .collect();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut experiments = txn.open_table(EXPERIMENTS).map_err(map_err!(Table))?;
            existed = experiments.remove(id).map_err(map_err!(Write))?.is_some();
            let mut computes = txn.open_table(COMPUTES).map_err(map_err!(Table))?;
            for key in &compute_keys {
                computes.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut networks = txn.open_table(NETWORKS).map_err(map_err!(Table))?;
            for key in &network_keys {
                networks.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            experiment = %id,
            existed,
            computes = compute_keys.len(),
            networks = network_keys.len(),
            "experiment deleted"
        );
        Ok(existed)
    }

    async fn find_location(&self, name: &str) -> StateResult<Option<Location>> {
        let locations: Vec<Location> = self.scan(LOCATIONS, "")?;
        Ok(locations.into_iter().find(|l| l.name == name))
    }

    async fn storages(&self, location: &str) -> StateResult<Vec<Storage>> {
        self.scan(STORAGES, &format!("{location}:"))
    }

    async fn networks(&self, location: &str) -> StateResult<Vec<Network>> {
        let networks: Vec<Network> = self.scan(NETWORKS, &format!("{location}:"))?;
        Ok(networks
            .into_iter()
            .filter(|n| n.experiment.is_none())
            .collect())
    }

    async fn experiment_networks(&self, experiment: &str) -> StateResult<Vec<Network>> {
        Ok(self
            .all_networks()?
            .into_iter()
            .filter(|n| n.experiment.as_deref() == Some(experiment))
            .collect())
    }

    async fn submit_network(&self, experiment: &str, spec: &NetworkSpec) -> StateResult<Network> {
        if self.get_experiment(experiment)?.is_none() {
            return Err(StateError::NotFound(format!("experiment {experiment}")));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = next_sequence(&txn, "network")?.to_string();
        let network = Network {
            id: id.clone(),
            name: spec.name.clone(),
            location: spec.location.clone(),
            address: Some(spec.address.clone()),
            experiment: Some(experiment.to_string()),
        };
        insert(&txn, NETWORKS, &format!("{}:{id}", spec.location), &network)?;
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%experiment, network = %spec.name, %id, "network submitted");
        Ok(network)
    }

    async fn find_computes(&self, query: &ComputeQuery) -> StateResult<Vec<ComputeResource>> {
        let prefix = match &query.scope {
            ComputeScope::Experiment(id) => format!("{id}:"),
            ComputeScope::Location(_) => String::new(),
        };
        let computes: Vec<ComputeResource> = self.scan(COMPUTES, &prefix)?;
        Ok(computes.into_iter().filter(|c| query.matches(c)).collect())
    }

    async fn submit_compute(
        &self,
        experiment: &str,
        spec: &ComputeSpec,
    ) -> StateResult<ComputeResource> {
        if self.get_experiment(experiment)?.is_none() {
            return Err(StateError::NotFound(format!("experiment {experiment}")));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = next_sequence(&txn, "compute")?.to_string();
        let nic = self.attach_nics(&txn, &spec.nic)?;
        let compute = ComputeResource {
            id: id.clone(),
            name: spec.name.clone(),
            state: ComputeState::Pending,
            nic,
            disk: spec
                .disk
                .iter()
                .map(|d| Disk {
                    storage: d.storage.clone(),
                    kind: d.kind,
                })
                .collect(),
            location: spec.location.clone(),
            experiment: experiment.to_string(),
            instance_type: spec.instance_type.clone(),
            context: spec.context.clone(),
        };
        insert(&txn, COMPUTES, &compute.table_key(), &compute)?;
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            %experiment,
            compute = %spec.name,
            %id,
            location = %spec.location,
            "compute submitted"
        );
        Ok(compute)
    }

    async fn reload_compute(&self, compute: &ComputeResource) -> StateResult<ComputeResource> {
        let key = compute.table_key();
        let mut stored: ComputeResource = self
            .get(COMPUTES, &key)?
            .ok_or_else(|| StateError::NotFound(format!("compute {}", compute.id)))?;
        if self.activation == Activation::OnReload
            && matches!(
                stored.state,
                ComputeState::Pending | ComputeState::Prolog | ComputeState::Boot
            )
        {
            stored.state = ComputeState::Active;
            self.put(COMPUTES, &key, &stored)?;
            debug!(compute = %stored.name, "compute activated");
        }
        Ok(stored)
    }

    async fn delete_compute(&self, compute: &ComputeResource) -> StateResult<bool> {
        let existed = self.remove(COMPUTES, &compute.table_key())?;
        debug!(compute = %compute.name, existed, "compute deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn experiment_spec(name: &str) -> ExperimentSpec {
        ExperimentSpec {
            name: name.to_string(),
            description: "test".to_string(),
            status: ExperimentStatus::Running,
            walltime: 3600,
        }
    }

    fn compute_spec(name: &str, location: &str, network: &str) -> ComputeSpec {
        ComputeSpec {
            name: name.to_string(),
            instance_type: "small".to_string(),
            disk: vec![DiskSpec {
                storage: "1".to_string(),
                kind: DiskKind::Os,
            }],
            nic: vec![NicSpec {
                network: network.to_string(),
                ip: None,
            }],
            location: location.to_string(),
            context: BTreeMap::new(),
        }
    }

    fn seeded() -> (StateStore, Network) {
        let store = StateStore::open_in_memory().unwrap();
        store.seed_location("uk-epcc").unwrap();
        store.seed_storage("uk-epcc", "Debian").unwrap();
        let wan = store
            .seed_network("uk-epcc", "WAN", Some("172.18.0.0"))
            .unwrap();
        (store, wan)
    }

    // ── Experiments ────────────────────────────────────────────────

    #[tokio::test]
    async fn experiment_submit_and_find_by_name() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        assert_eq!(exp.id, "1");
        assert_eq!(exp.status, ExperimentStatus::Running);

        let found = store
            .find_experiments(&ExperimentQuery::named("Demo"))
            .await
            .unwrap();
        assert_eq!(found, vec![exp]);
        assert!(
            store
                .find_experiments(&ExperimentQuery::named("Other"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn experiment_status_update() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        store
            .update_experiment_status(&exp.id, ExperimentStatus::Terminating)
            .await
            .unwrap();
        let reloaded = store.reload_experiment(&exp.id).await.unwrap();
        assert_eq!(reloaded.status, ExperimentStatus::Terminating);
    }

    #[tokio::test]
    async fn reload_missing_experiment_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.reload_experiment("99").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn walltime_expiry_terminates_running_experiment() {
        let now = Arc::new(AtomicU64::new(1_000));
        let clock = now.clone();
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_clock(move || clock.load(Ordering::SeqCst));
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();

        now.store(1_000 + 3_599, Ordering::SeqCst);
        let still = store.reload_experiment(&exp.id).await.unwrap();
        assert_eq!(still.status, ExperimentStatus::Running);

        now.store(1_000 + 3_600, Ordering::SeqCst);
        let expired = store.reload_experiment(&exp.id).await.unwrap();
        assert_eq!(expired.status, ExperimentStatus::Terminated);
    }

    #[tokio::test]
    async fn delete_experiment_cascades() {
        let (store, wan) = seeded();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        store
            .submit_compute(&exp.id, &compute_spec("server-experiment1", "uk-epcc", &wan.id))
            .await
            .unwrap();
        store
            .submit_network(
                &exp.id,
                &NetworkSpec {
                    name: "network-experiment1".to_string(),
                    location: "uk-epcc".to_string(),
                    address: "192.168.0.0".to_string(),
                    size: 24,
                    bandwidth: 1000,
                    latency: 0,
                    lossrate: 0,
                },
            )
            .await
            .unwrap();

        assert!(store.delete_experiment(&exp.id).await.unwrap());
        assert!(store.list_computes().unwrap().is_empty());
        assert!(store.experiment_networks(&exp.id).await.unwrap().is_empty());
        // Site networks survive.
        assert_eq!(store.networks("uk-epcc").await.unwrap(), vec![wan]);
        assert!(!store.delete_experiment(&exp.id).await.unwrap());
    }

    // ── Reference data ─────────────────────────────────────────────

    #[tokio::test]
    async fn reference_data_lookups() {
        let (store, wan) = seeded();
        let loc = store.find_location("uk-epcc").await.unwrap().unwrap();
        assert_eq!(loc.id, "uk-epcc");
        assert!(store.find_location("nowhere").await.unwrap().is_none());

        let storages = store.storages("uk-epcc").await.unwrap();
        assert_eq!(storages.len(), 1);
        assert_eq!(storages[0].name, "Debian");
        assert_eq!(store.networks("uk-epcc").await.unwrap(), vec![wan]);
        assert!(store.storages("fr-inria").await.unwrap().is_empty());
    }

    // ── Computes ───────────────────────────────────────────────────

    #[tokio::test]
    async fn compute_submit_allocates_addresses() {
        let (store, wan) = seeded();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        let a = store
            .submit_compute(&exp.id, &compute_spec("a", "uk-epcc", &wan.id))
            .await
            .unwrap();
        let b = store
            .submit_compute(&exp.id, &compute_spec("b", "uk-epcc", &wan.id))
            .await
            .unwrap();
        assert_eq!(a.state, ComputeState::Pending);
        assert_eq!(a.primary_ip(), Some("172.18.0.2"));
        assert_eq!(b.primary_ip(), Some("172.18.0.3"));
    }

    #[tokio::test]
    async fn compute_keeps_fixed_address_and_unaddressed_networks() {
        let (store, _wan) = seeded();
        let bare = store.seed_network("uk-epcc", "internal", None).unwrap();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        let mut spec = compute_spec("a", "uk-epcc", &bare.id);
        spec.nic.push(NicSpec {
            network: bare.id.clone(),
            ip: Some("192.168.0.4".to_string()),
        });
        let c = store.submit_compute(&exp.id, &spec).await.unwrap();
        assert_eq!(c.nic[0].ip, None);
        assert_eq!(c.nic[1].ip.as_deref(), Some("192.168.0.4"));
    }

    #[tokio::test]
    async fn compute_submit_unknown_network_fails() {
        let (store, _wan) = seeded();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        let err = store
            .submit_compute(&exp.id, &compute_spec("a", "uk-epcc", "404"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn compute_activates_on_reload() {
        let (store, wan) = seeded();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        let c = store
            .submit_compute(&exp.id, &compute_spec("a", "uk-epcc", &wan.id))
            .await
            .unwrap();
        let reloaded = store.reload_compute(&c).await.unwrap();
        assert!(reloaded.is_active());
    }

    #[tokio::test]
    async fn manual_activation_holds_state() {
        let (store, wan) = seeded();
        let store = store.with_activation(Activation::Manual);
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        let c = store
            .submit_compute(&exp.id, &compute_spec("a", "uk-epcc", &wan.id))
            .await
            .unwrap();
        assert_eq!(
            store.reload_compute(&c).await.unwrap().state,
            ComputeState::Pending
        );
        store.set_compute_state(&c, ComputeState::Failed).unwrap();
        assert!(store.reload_compute(&c).await.unwrap().is_failed());
    }

    #[tokio::test]
    async fn compute_queries_by_scope_and_name() {
        let (store, wan) = seeded();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        for name in ["uk-epcc-0-client-e1", "uk-epcc-1-client-e1", "server-experiment1"] {
            store
                .submit_compute(&exp.id, &compute_spec(name, "uk-epcc", &wan.id))
                .await
                .unwrap();
        }
        let all = store
            .find_computes(&ComputeQuery::in_experiment(&exp.id))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let clients = store
            .find_computes(&ComputeQuery::in_location("uk-epcc").name_ending_with("client-e1"))
            .await
            .unwrap();
        assert_eq!(clients.len(), 2);

        let server = store
            .find_computes(&ComputeQuery::in_experiment(&exp.id).named("server-experiment1"))
            .await
            .unwrap();
        assert_eq!(server.len(), 1);
    }

    #[tokio::test]
    async fn compute_delete_and_reload_missing() {
        let (store, wan) = seeded();
        let exp = store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        let c = store
            .submit_compute(&exp.id, &compute_spec("a", "uk-epcc", &wan.id))
            .await
            .unwrap();
        assert!(store.delete_compute(&c).await.unwrap());
        assert!(!store.delete_compute(&c).await.unwrap());
        assert!(store.reload_compute(&c).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn submit_into_missing_experiment_fails() {
        let (store, wan) = seeded();
        let err = store
            .submit_compute("42", &compute_spec("a", "uk-epcc", &wan.id))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn address_allocation_skips_gateway() {
        assert_eq!(allocate_address("10.0.0.0", 1).as_deref(), Some("10.0.0.2"));
        assert_eq!(allocate_address("10.0.0.0", 255).as_deref(), Some("10.0.1.0"));
        assert_eq!(allocate_address("garbage", 1), None);
    }

    // ── Persistence ────────────────────────────────────────────────

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sim.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.submit_experiment(&experiment_spec("Demo")).await.unwrap();
        }

        // Reopen the same database file; counters continue.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.list_experiments().unwrap().len(), 1);
        let second = store.submit_experiment(&experiment_spec("Other")).await.unwrap();
        assert_eq!(second.id, "2");
    }

    #[tokio::test]
    async fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_experiments().unwrap().is_empty());
        assert!(store.list_computes().unwrap().is_empty());
        assert!(
            store
                .find_experiments(&ExperimentQuery::default())
                .await
                .unwrap()
                .is_empty()
        );
        assert!(!store.delete_experiment("nope").await.unwrap());
    }
}
