//! `run` mode: provision the experiment, then autoscale until it ends.
//!
//! Setup always runs to completion: a Ctrl-C that arrives while machines
//! are being provisioned or probed is acted on once setup returns, and is
//! handled like a failure. Failures are logged with their cause chain and
//! followed by a grace period, after which the experiment is deleted
//! unless Ctrl-C is pressed again. Ctrl-C while the loop runs leaves the
//! experiment in place.

use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::sync::watch;
use tracing::{error, info, warn};

use cumulus_autoscale::{ControlLoop, ScalingPolicy};
use cumulus_core::{CumulusConfig, Timings};
use cumulus_health::ReadinessProber;
use cumulus_placement::PlacementRegistry;
use cumulus_scheduler::{
    CleanupOutcome, ExperimentManager, Fleet, Provisioner, Roles, wait_until_ready,
};
use cumulus_state::{Experiment, ExperimentStatus};

use crate::backend::Backend;

pub async fn run(config: &CumulusConfig, backend: &Backend, delete_on_exit: bool) -> anyhow::Result<()> {
    run_with(config, backend, delete_on_exit, watch_interrupts()).await
}

/// [`run`] driven by an explicit interrupt flag.
async fn run_with(
    config: &CumulusConfig,
    backend: &Backend,
    delete_on_exit: bool,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let timings = config.scaling.timings()?;
    let walltime = config.experiment.walltime()?;

    let experiments = ExperimentManager::new(backend.repo.clone());
    let prober = Arc::new(backend.prober(config)?);
    let description = config.experiment.description.as_deref().unwrap_or_default();
    let experiment = experiments
        .find_or_create(&config.experiment.name, description, walltime)
        .await?;

    // ── Setup ──────────────────────────────────────────────────────

    let setup = setup(config, backend, &experiments, &prober, &experiment, &timings).await;
    let Ready {
        experiment,
        fleet,
        roles,
        registry,
    } = match setup {
        Ok(_) if *shutdown.borrow() => {
            let e = anyhow!("interrupted during setup");
            return fail(&experiments, &experiment, e, timings.cleanup_grace, shutdown).await;
        }
        Ok(ready) => ready,
        Err(e) => return fail(&experiments, &experiment, e, timings.cleanup_grace, shutdown).await,
    };

    // ── Control loop ───────────────────────────────────────────────

    let monitor = match backend.monitor(config, &experiment, shutdown.clone()) {
        Ok(monitor) => monitor,
        Err(e) => return fail(&experiments, &experiment, e, timings.cleanup_grace, shutdown).await,
    };
    let mut control = ControlLoop::new(
        ExperimentManager::new(backend.repo.clone()),
        fleet,
        roles,
        registry,
        monitor,
        prober,
        ScalingPolicy::from(&config.scaling),
        &config.scaling.metric,
    )
    .with_timings(timings)
    .with_shutdown(shutdown.clone());

    match control.run(&experiment).await {
        Ok(observed) => {
            if *shutdown.borrow() {
                warn!(experiment = %experiment.id, "interrupted, experiment kept");
                return Ok(());
            }
            info!(
                experiment = %experiment.id,
                status = ?observed.last(),
                clients = control.registry().total(),
                "run finished"
            );
            if delete_on_exit {
                let outcome = experiments
                    .cleanup_after_grace(Some(&experiment), timings.cleanup_grace, next_interrupt(shutdown))
                    .await?;
                info!(experiment = %experiment.id, ?outcome, "cleanup done");
            }
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            warn!(experiment = %experiment.id, "interrupted, experiment kept");
            Ok(())
        }
        Err(e) if *shutdown.borrow() => {
            error!(experiment = %experiment.id, error = %e, "run failed after interrupt");
            warn!(experiment = %experiment.id, "interrupted, experiment kept");
            Err(e.into())
        }
        Err(e) => fail(&experiments, &experiment, e.into(), timings.cleanup_grace, shutdown).await,
    }
}

struct Ready {
    experiment: Experiment,
    fleet: Fleet,
    roles: Roles,
    registry: PlacementRegistry,
}

/// Provision the fleet, start the experiment and wait for every machine.
async fn setup(
    config: &CumulusConfig,
    backend: &Backend,
    experiments: &ExperimentManager,
    prober: &ReadinessProber,
    experiment: &Experiment,
    timings: &Timings,
) -> anyhow::Result<Ready> {
    let provisioner = Provisioner::new(backend.repo.clone());
    let fleet = Fleet::prepare(provisioner, experiment.clone(), config.fleet.clone()).await?;
    let roles = fleet.provision_roles().await?;
    let mut registry = fleet.rehydrate_registry().await?;
    fleet.ensure_initial_clients(&mut registry, &roles).await?;
    let experiment = experiments
        .transition_to(experiment, ExperimentStatus::Running)
        .await?;

    let mut machines = roles.all();
    machines.extend(registry.clients().into_iter().cloned());
    info!(experiment = %experiment.id, machines = machines.len(), "waiting for fleet");
    let ready = wait_until_ready(&backend.repo, prober, &machines, timings.setup_poll).await?;
    let (roles, clients) = match ready.as_slice() {
        [aggregator, server, clients @ ..] => (
            Roles {
                aggregator: aggregator.clone(),
                server: server.clone(),
            },
            clients,
        ),
        _ => bail!("readiness barrier returned {} of {} machines", ready.len(), machines.len()),
    };
    for client in clients {
        registry.refresh(client);
    }

    info!(
        aggregator = ?roles.aggregator.primary_ip(),
        server = ?roles.server.primary_ip(),
        clients = registry.total(),
        "fleet ready"
    );
    for client in registry.clients() {
        info!(client = %client.name, location = %client.location, ip = ?client.primary_ip(), "client ready");
    }

    let experiment = experiments.reload(&experiment).await?;
    Ok(Ready {
        experiment,
        fleet,
        roles,
        registry,
    })
}

/// Log `e`, then give the operator the grace period to keep the experiment.
async fn fail(
    experiments: &ExperimentManager,
    experiment: &Experiment,
    e: anyhow::Error,
    grace: std::time::Duration,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    error!(experiment = %experiment.id, error = %format!("{e:#}"), "run failed");
    match experiments
        .cleanup_after_grace(Some(experiment), grace, next_interrupt(shutdown))
        .await
    {
        Ok(CleanupOutcome::Deleted) | Ok(CleanupOutcome::AlreadyGone) => {}
        Ok(CleanupOutcome::Skipped) => {
            info!(experiment = %experiment.id, "experiment left for inspection");
        }
        Err(cleanup) => {
            error!(experiment = %experiment.id, error = %cleanup, "cleanup failed");
        }
    }
    Err(e)
}

// ── Interrupts ─────────────────────────────────────────────────────

/// Set the returned flag on every Ctrl-C. Each one notifies receivers,
/// also when the flag is already set.
fn watch_interrupts() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received");
            if tx.send(true).is_err() {
                break;
            }
        }
    });
    rx
}

/// Resolves on the first Ctrl-C after it is polled. Earlier ones are
/// ignored. Never resolves if nothing can send any more.
async fn next_interrupt(mut shutdown: watch::Receiver<bool>) {
    shutdown.mark_unchanged();
    if shutdown.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
