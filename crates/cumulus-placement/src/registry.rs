//! Per-location client bookkeeping and load balancing.
//!
//! The registry maps each location to its clients in assignment order,
//! oldest first. Locations keep the caller's order, which breaks ties in
//! both directions: the first listed location wins.

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

use cumulus_state::{ComputeQuery, ComputeResource, ExperimentId, Location, ResourceRepository, StateResult};

use crate::naming::{client_ordinal, client_suffix};

/// Clients of one experiment, grouped by location.
#[derive(Debug, Clone)]
pub struct PlacementRegistry {
    experiment: ExperimentId,
    order: Vec<Location>,
    clients: HashMap<String, VecDeque<ComputeResource>>,
}

impl PlacementRegistry {
    /// An empty registry over `locations`, in tie-break order.
    pub fn new(experiment: impl Into<ExperimentId>, locations: Vec<Location>) -> Self {
        let clients = locations
            .iter()
            .map(|l| (l.id.clone(), VecDeque::new()))
            .collect();
        Self {
            experiment: experiment.into(),
            order: locations,
            clients,
        }
    }

    /// Rebuild the registry from the clients that already exist at each
    /// location, e.g. after the controller was restarted.
    pub async fn rehydrate(
        repo: &dyn ResourceRepository,
        experiment: &str,
        locations: Vec<Location>,
    ) -> StateResult<Self> {
        let mut registry = Self::new(experiment, locations);
        let suffix = client_suffix(experiment);
        for location in registry.order.clone() {
            let query = ComputeQuery::in_location(&location.id).name_ending_with(&suffix);
            let mut found: Vec<ComputeResource> = repo
                .find_computes(&query)
                .await?
                .into_iter()
                .filter(|c| c.experiment == experiment)
                .collect();
            found.sort_by(|a, b| {
                let key = |c: &ComputeResource| (client_ordinal(&c.name, experiment), c.id.len(), c.id.clone());
                key(a).cmp(&key(b))
            });
            for compute in found {
                debug!(location = %location.name, client = %compute.name, "client rediscovered");
                registry.assign(&location.id, compute);
            }
        }
        info!(%experiment, clients = registry.total(), "placement registry rehydrated");
        Ok(registry)
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn locations(&self) -> &[Location] {
        &self.order
    }

    /// Record `compute` as the newest client at `location`.
    pub fn assign(&mut self, location: &str, compute: ComputeResource) {
        self.clients
            .entry(location.to_string())
            .or_default()
            .push_back(compute);
    }

    /// Number of clients at `location`.
    pub fn count(&self, location: &str) -> usize {
        self.clients.get(location).map_or(0, VecDeque::len)
    }

    /// Number of clients across all locations.
    pub fn total(&self) -> usize {
        self.clients.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Clients at `location`, oldest first.
    pub fn clients_at(&self, location: &str) -> impl Iterator<Item = &ComputeResource> {
        self.clients.get(location).into_iter().flatten()
    }

    /// All clients, location by location in tie-break order.
    pub fn clients(&self) -> Vec<&ComputeResource> {
        self.order
            .iter()
            .flat_map(|l| self.clients_at(&l.id))
            .collect()
    }

    /// Location with the fewest clients.
    pub fn select_least_loaded(&self) -> Option<&Location> {
        self.order.iter().min_by_key(|l| self.count(&l.id))
    }

    /// Remove and return the oldest client of the location with the most
    /// clients. The caller destroys it.
    pub fn select_most_loaded_victim(&mut self) -> Option<ComputeResource> {
        let location = self
            .order
            .iter()
            .min_by_key(|l| Reverse(self.count(&l.id)))?
            .id
            .clone();
        let victim = self.clients.get_mut(&location)?.pop_front()?;
        debug!(%location, client = %victim.name, "scale-down victim selected");
        Some(victim)
    }

    /// Replace the stored copy of a client with a fresher one.
    pub fn refresh(&mut self, updated: &ComputeResource) {
        for queue in self.clients.values_mut() {
            if let Some(slot) = queue.iter_mut().find(|c| c.id == updated.id) {
                *slot = updated.clone();
                return;
            }
        }
    }

    /// Drop a client without selecting it as a victim.
    pub fn remove(&mut self, compute_id: &str) -> Option<ComputeResource> {
        for queue in self.clients.values_mut() {
            if let Some(pos) = queue.iter().position(|c| c.id == compute_id) {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Ordinal for the next client name: one past the highest in use.
    pub fn next_ordinal(&self) -> u32 {
        self.clients
            .values()
            .flatten()
            .filter_map(|c| client_ordinal(&c.name, &self.experiment))
            .max()
            .map_or(0, |max| max + 1)
    }
}
