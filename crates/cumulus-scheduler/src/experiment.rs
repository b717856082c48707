//! Experiment lifecycle: find-or-create, status transitions, cleanup.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use cumulus_state::{Experiment, ExperimentQuery, ExperimentSpec, ExperimentStatus, SharedRepository};

use crate::error::SchedulerResult;

/// What happened to an experiment handed to [`ExperimentManager::cleanup_after_grace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted,
    /// Nothing to delete: no experiment, or it was already gone.
    AlreadyGone,
    /// Interrupted during the grace period; the experiment was kept.
    Skipped,
}

pub struct ExperimentManager {
    repo: SharedRepository,
}

impl ExperimentManager {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    /// Reuse the running experiment called `name`, or submit a new one in
    /// `waiting` status.
    pub async fn find_or_create(
        &self,
        name: &str,
        description: &str,
        walltime: Duration,
    ) -> SchedulerResult<Experiment> {
        let query = ExperimentQuery::named(name).with_status(ExperimentStatus::Running);
        if let Some(existing) = self.repo.find_experiments(&query).await?.into_iter().next() {
            info!(experiment = %existing.id, %name, "experiment found");
            return Ok(existing);
        }

        let spec = ExperimentSpec {
            name: name.to_string(),
            description: description.to_string(),
            status: ExperimentStatus::Waiting,
            walltime: walltime.as_secs(),
        };
        let created = self.repo.submit_experiment(&spec).await?;
        info!(experiment = %created.id, %name, walltime = spec.walltime, "experiment created");
        Ok(created)
    }

    /// Move `experiment` to `status`. No request is made if it is already there.
    pub async fn transition_to(
        &self,
        experiment: &Experiment,
        status: ExperimentStatus,
    ) -> SchedulerResult<Experiment> {
        if experiment.status == status {
            return Ok(experiment.clone());
        }
        let updated = self.repo.update_experiment_status(&experiment.id, status).await?;
        info!(experiment = %experiment.id, from = %experiment.status, to = %status, "experiment status changed");
        Ok(updated)
    }

    pub async fn reload(&self, experiment: &Experiment) -> SchedulerResult<Experiment> {
        Ok(self.repo.reload_experiment(&experiment.id).await?)
    }

    /// Delete `experiment`, if any. Returns whether something was deleted.
    pub async fn cleanup(&self, experiment: Option<&Experiment>) -> SchedulerResult<bool> {
        let Some(experiment) = experiment else {
            return Ok(false);
        };
        let deleted = self.repo.delete_experiment(&experiment.id).await?;
        if deleted {
            info!(experiment = %experiment.id, "experiment deleted");
        } else {
            info!(experiment = %experiment.id, "experiment already gone");
        }
        Ok(deleted)
    }

    /// Wait `grace`, then delete `experiment`. If `interrupt` resolves first
    /// the experiment is left in place.
    pub async fn cleanup_after_grace<F>(
        &self,
        experiment: Option<&Experiment>,
        grace: Duration,
        interrupt: F,
    ) -> SchedulerResult<CleanupOutcome>
    where
        F: Future<Output = ()>,
    {
        let Some(exp) = experiment else {
            return Ok(CleanupOutcome::AlreadyGone);
        };
        warn!(
            experiment = %exp.id,
            grace_secs = grace.as_secs(),
            "experiment will be deleted after the grace period, interrupt to keep it"
        );
        tokio::select! {
            _ = tokio::time::sleep(grace) => {}
            _ = interrupt => {
                warn!(experiment = %exp.id, "cleanup interrupted, experiment kept");
                return Ok(CleanupOutcome::Skipped);
            }
        }
        if self.cleanup(Some(exp)).await? {
            Ok(CleanupOutcome::Deleted)
        } else {
            Ok(CleanupOutcome::AlreadyGone)
        }
    }
}
