//! Idempotent find-or-create of experiment resources.
//!
//! Resource names are the only idempotency key. Every create first looks
//! for an existing resource under the experiment and only submits when
//! nothing matches, so a run can be restarted against a live experiment.

use tracing::{debug, info};

use cumulus_state::{
    ComputeQuery, ComputeResource, ComputeSpec, Experiment, Location, Network, NetworkSpec,
    SharedRepository, Storage,
};

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Clone)]
pub struct Provisioner {
    repo: SharedRepository,
}

impl Provisioner {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &SharedRepository {
        &self.repo
    }

    /// Return the experiment's first compute accepted by `matches`, or
    /// submit one built from `spec`.
    pub async fn find_or_create_compute<F>(
        &self,
        experiment: &Experiment,
        matches: F,
        spec: &ComputeSpec,
    ) -> SchedulerResult<ComputeResource>
    where
        F: Fn(&ComputeResource) -> bool,
    {
        let existing = self
            .repo
            .find_computes(&ComputeQuery::in_experiment(&experiment.id))
            .await?;
        if let Some(found) = existing.into_iter().find(|c| matches(c)) {
            debug!(experiment = %experiment.id, compute = %found.name, id = %found.id, "compute found");
            return Ok(found);
        }
        let created = self.repo.submit_compute(&experiment.id, spec).await?;
        info!(
            experiment = %experiment.id,
            compute = %created.name,
            id = %created.id,
            location = %created.location,
            "compute created"
        );
        Ok(created)
    }

    /// [`find_or_create_compute`](Self::find_or_create_compute) keyed on `spec.name`.
    pub async fn find_or_create_named(
        &self,
        experiment: &Experiment,
        spec: &ComputeSpec,
    ) -> SchedulerResult<ComputeResource> {
        self.find_or_create_compute(experiment, |c| c.name == spec.name, spec)
            .await
    }

    /// Return the experiment's network called `spec.name`, or submit it.
    pub async fn find_or_create_network(
        &self,
        experiment: &Experiment,
        spec: &NetworkSpec,
    ) -> SchedulerResult<Network> {
        let existing = self.repo.experiment_networks(&experiment.id).await?;
        if let Some(found) = existing.into_iter().find(|n| n.name == spec.name) {
            debug!(experiment = %experiment.id, network = %found.name, id = %found.id, "network found");
            return Ok(found);
        }
        let created = self.repo.submit_network(&experiment.id, spec).await?;
        info!(experiment = %experiment.id, network = %created.name, id = %created.id, "network created");
        Ok(created)
    }

    pub async fn location(&self, name: &str) -> SchedulerResult<Location> {
        self.repo
            .find_location(name)
            .await?
            .ok_or_else(|| SchedulerError::LocationNotFound(name.to_string()))
    }

    /// Storage template `name` at `location`.
    pub async fn storage(&self, location: &Location, name: &str) -> SchedulerResult<Storage> {
        self.repo
            .storages(&location.id)
            .await?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SchedulerError::StorageNotFound {
                location: location.name.clone(),
                name: name.to_string(),
            })
    }

    /// Site network `name` at `location`.
    pub async fn network(&self, location: &Location, name: &str) -> SchedulerResult<Network> {
        self.repo
            .networks(&location.id)
            .await?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| SchedulerError::NetworkNotFound {
                location: location.name.clone(),
                name: name.to_string(),
            })
    }

    pub async fn reload(&self, compute: &ComputeResource) -> SchedulerResult<ComputeResource> {
        Ok(self.repo.reload_compute(compute).await?)
    }

    /// Destroy a compute. Returns false if it was already gone.
    pub async fn destroy(&self, compute: &ComputeResource) -> SchedulerResult<bool> {
        let existed = self.repo.delete_compute(compute).await?;
        info!(compute = %compute.name, id = %compute.id, existed, "compute destroyed");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_state::{ExperimentSpec, ExperimentStatus, NicSpec, ResourceRepository, StateStore};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn setup() -> (Arc<StateStore>, Provisioner, Experiment, Network) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.seed_location("uk-epcc").unwrap();
        store.seed_storage("uk-epcc", "debian-7").unwrap();
        let wan = store.seed_network("uk-epcc", "WAN", Some("172.18.0.0")).unwrap();
        let exp = store
            .submit_experiment(&ExperimentSpec {
                name: "scaling".to_string(),
                description: String::new(),
                status: ExperimentStatus::Running,
                walltime: 3600,
            })
            .await
            .unwrap();
        (store.clone(), Provisioner::new(store), exp, wan)
    }

    fn spec(name: &str, network: &str) -> ComputeSpec {
        ComputeSpec {
            name: name.to_string(),
            instance_type: "small".to_string(),
            disk: Vec::new(),
            nic: vec![NicSpec {
                network: network.to_string(),
                ip: None,
            }],
            location: "uk-epcc".to_string(),
            context: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let (store, prov, exp, wan) = setup().await;
        let first = prov.find_or_create_named(&exp, &spec("server-experiment1", &wan.id)).await.unwrap();
        let second = prov.find_or_create_named(&exp, &spec("server-experiment1", &wan.id)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_computes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn predicate_selects_existing_compute() {
        let (store, prov, exp, wan) = setup().await;
        let server = prov.find_or_create_named(&exp, &spec("server-experiment1", &wan.id)).await.unwrap();
        let found = prov
            .find_or_create_compute(&exp, |c| c.name.starts_with("server"), &spec("other", &wan.id))
            .await
            .unwrap();
        assert_eq!(found.id, server.id);
        assert_eq!(store.list_computes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn network_find_or_create_is_idempotent() {
        let (store, prov, exp, _) = setup().await;
        let spec = NetworkSpec {
            name: "network-experiment1".to_string(),
            location: "uk-epcc".to_string(),
            address: "192.168.0.0".to_string(),
            size: 24,
            bandwidth: 100,
            latency: 0,
            lossrate: 0,
        };
        let first = prov.find_or_create_network(&exp, &spec).await.unwrap();
        let second = prov.find_or_create_network(&exp, &spec).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.experiment_networks(&exp.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reference_lookups() {
        let (_, prov, _, wan) = setup().await;
        let loc = prov.location("uk-epcc").await.unwrap();
        assert_eq!(prov.storage(&loc, "debian-7").await.unwrap().name, "debian-7");
        assert_eq!(prov.network(&loc, "WAN").await.unwrap().id, wan.id);

        assert!(matches!(
            prov.location("nowhere").await,
            Err(SchedulerError::LocationNotFound(name)) if name == "nowhere"
        ));
        assert!(matches!(
            prov.storage(&loc, "ubuntu").await,
            Err(SchedulerError::StorageNotFound { .. })
        ));
        assert!(matches!(
            prov.network(&loc, "LAN").await,
            Err(SchedulerError::NetworkNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn destroy_twice() {
        let (_, prov, exp, wan) = setup().await;
        let vm = prov.find_or_create_named(&exp, &spec("vm", &wan.id)).await.unwrap();
        assert!(prov.destroy(&vm).await.unwrap());
        assert!(!prov.destroy(&vm).await.unwrap());
    }
}
