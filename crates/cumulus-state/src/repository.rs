//! The resource repository interface and its typed queries.
//!
//! The core only needs query-by-predicate, submit-with-spec,
//! reload-by-identity, delete-by-identity and status updates. Queries are
//! plain data so every backend filters the same way.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StateResult;
use crate::types::*;

/// Shared handle to a repository backend.
pub type SharedRepository = Arc<dyn ResourceRepository>;

/// Collection-style access to experiments and their resources.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    // ── Experiments ────────────────────────────────────────────────

    async fn find_experiments(&self, query: &ExperimentQuery) -> StateResult<Vec<Experiment>>;

    async fn submit_experiment(&self, spec: &ExperimentSpec) -> StateResult<Experiment>;

    /// Re-fetch an experiment. Fails with `NotFound` if it is gone.
    async fn reload_experiment(&self, id: &str) -> StateResult<Experiment>;

    async fn update_experiment_status(
        &self,
        id: &str,
        status: ExperimentStatus,
    ) -> StateResult<Experiment>;

    /// Delete an experiment. Returns false if it was already absent.
    async fn delete_experiment(&self, id: &str) -> StateResult<bool>;

    // ── Reference data ─────────────────────────────────────────────

    async fn find_location(&self, name: &str) -> StateResult<Option<Location>>;

    async fn storages(&self, location: &str) -> StateResult<Vec<Storage>>;

    async fn networks(&self, location: &str) -> StateResult<Vec<Network>>;

    // ── Networks owned by an experiment ────────────────────────────

    async fn experiment_networks(&self, experiment: &str) -> StateResult<Vec<Network>>;

    async fn submit_network(&self, experiment: &str, spec: &NetworkSpec) -> StateResult<Network>;

    // ── Computes ───────────────────────────────────────────────────

    async fn find_computes(&self, query: &ComputeQuery) -> StateResult<Vec<ComputeResource>>;

    async fn submit_compute(
        &self,
        experiment: &str,
        spec: &ComputeSpec,
    ) -> StateResult<ComputeResource>;

    /// Re-fetch a compute. Fails with `NotFound` if it is gone.
    async fn reload_compute(&self, compute: &ComputeResource) -> StateResult<ComputeResource>;

    /// Destroy a compute. Returns false if it was already absent.
    async fn delete_compute(&self, compute: &ComputeResource) -> StateResult<bool>;
}

/// Filter over experiments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentQuery {
    pub name: Option<String>,
    pub status: Option<ExperimentStatus>,
}

impl ExperimentQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, experiment: &Experiment) -> bool {
        self.name.as_ref().is_none_or(|n| *n == experiment.name)
            && self.status.is_none_or(|s| s == experiment.status)
    }
}

/// Collection a compute query scans.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeScope {
    Experiment(ExperimentId),
    Location(LocationId),
}

/// Name predicate of a compute query.
#[derive(Debug, Clone, PartialEq)]
pub enum NameMatch {
    Any,
    Exact(String),
    Suffix(String),
}

impl NameMatch {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Any => true,
            NameMatch::Exact(n) => name == n,
            NameMatch::Suffix(s) => name.ends_with(s.as_str()),
        }
    }
}

/// Filter over compute resources.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeQuery {
    pub scope: ComputeScope,
    pub name: NameMatch,
}

impl ComputeQuery {
    pub fn in_experiment(experiment: impl Into<String>) -> Self {
        Self {
            scope: ComputeScope::Experiment(experiment.into()),
            name: NameMatch::Any,
        }
    }

    pub fn in_location(location: impl Into<String>) -> Self {
        Self {
            scope: ComputeScope::Location(location.into()),
            name: NameMatch::Any,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = NameMatch::Exact(name.into());
        self
    }

    pub fn name_ending_with(mut self, suffix: impl Into<String>) -> Self {
        self.name = NameMatch::Suffix(suffix.into());
        self
    }

    pub fn matches(&self, compute: &ComputeResource) -> bool {
        let in_scope = match &self.scope {
            ComputeScope::Experiment(id) => compute.experiment == *id,
            ComputeScope::Location(id) => compute.location == *id,
        };
        in_scope && self.name.matches(&compute.name)
    }
}
