//! Barrier that waits until a set of computes is up.
//!
//! Each round reloads every compute, aborts if any of them failed, and
//! otherwise probes them all once they are active. Reloads and probes of
//! one round run concurrently; the registry is never touched here.

use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info};

use cumulus_health::ReadinessProber;
use cumulus_state::{ComputeResource, SharedRepository};

use crate::error::{SchedulerError, SchedulerResult};

/// Poll every `poll` until all `computes` are active and reachable.
///
/// Returns the freshly reloaded computes. There is no upper bound on the
/// number of rounds.
pub async fn wait_until_ready(
    repo: &SharedRepository,
    prober: &ReadinessProber,
    computes: &[ComputeResource],
    poll: Duration,
) -> SchedulerResult<Vec<ComputeResource>> {
    let mut round: u64 = 0;
    loop {
        round += 1;
        let reloaded = join_all(computes.iter().map(|c| repo.reload_compute(c)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(failed) = reloaded.iter().find(|c| c.is_failed()) {
            return Err(SchedulerError::ResourceFailed {
                name: failed.name.clone(),
                id: failed.id.clone(),
            });
        }

        let pending: Vec<&str> = reloaded
            .iter()
            .filter(|c| !c.is_active())
            .map(|c| c.name.as_str())
            .collect();
        if pending.is_empty() {
            let reachable = join_all(reloaded.iter().map(|c| prober.is_reachable(c))).await;
            if reachable.iter().all(|r| *r) {
                debug!(computes = reloaded.len(), round, "all computes ready");
                return Ok(reloaded);
            }
            let unreachable: Vec<&str> = reloaded
                .iter()
                .zip(&reachable)
                .filter(|(_, r)| !**r)
                .map(|(c, _)| c.name.as_str())
                .collect();
            info!(?unreachable, round, "not ready, waiting");
        } else {
            info!(?pending, round, "not ready, waiting");
        }
        tokio::time::sleep(poll).await;
    }
}

/// [`wait_until_ready`] for a single compute.
pub async fn wait_until_reachable(
    repo: &SharedRepository,
    prober: &ReadinessProber,
    compute: &ComputeResource,
    poll: Duration,
) -> SchedulerResult<ComputeResource> {
    let mut ready = wait_until_ready(repo, prober, std::slice::from_ref(compute), poll).await?;
    ready.pop().ok_or_else(|| SchedulerError::ResourceFailed {
        name: compute.name.clone(),
        id: compute.id.clone(),
    })
}
