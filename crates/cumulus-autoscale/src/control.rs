//! The autoscaling control loop.
//!
//! Every tick re-reads the experiment status. While the experiment is
//! running the loop samples the server's load metric and adds a client at
//! the least-loaded location or removes the oldest client of the
//! most-loaded one. The loop ends the moment a terminal status is seen.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use cumulus_core::Timings;
use cumulus_health::ReadinessProber;
use cumulus_metrics::{HostRef, MetricQuery, MonitorClient, NUMERIC};
use cumulus_placement::PlacementRegistry;
use cumulus_scheduler::{ExperimentManager, Fleet, Roles, wait_until_reachable};
use cumulus_state::{Experiment, ExperimentStatus};

use crate::error::ControlResult;
use crate::policy::{ScaleDecision, ScalingPolicy};

/// What one tick observed and did.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub status: ExperimentStatus,
    /// Set only for ticks that saw a running experiment.
    pub decision: Option<ScaleDecision>,
}

pub struct ControlLoop {
    experiments: ExperimentManager,
    fleet: Fleet,
    roles: Roles,
    registry: PlacementRegistry,
    monitor: MonitorClient,
    prober: Arc<ReadinessProber>,
    policy: ScalingPolicy,
    metric: String,
    timings: Timings,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        experiments: ExperimentManager,
        fleet: Fleet,
        roles: Roles,
        registry: PlacementRegistry,
        monitor: MonitorClient,
        prober: Arc<ReadinessProber>,
        policy: ScalingPolicy,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            experiments,
            fleet,
            roles,
            registry,
            monitor,
            prober,
            policy,
            metric: metric.into(),
            timings: Timings::default(),
            shutdown: None,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Stop between ticks once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn registry(&self) -> &PlacementRegistry {
        &self.registry
    }

    /// Tick until the experiment reaches a terminal status. Returns every
    /// status observed, the terminal one last.
    pub async fn run(&mut self, experiment: &Experiment) -> ControlResult<Vec<ExperimentStatus>> {
        info!(
            experiment = %experiment.id,
            clients = self.registry.total(),
            tick_secs = self.timings.tick.as_secs(),
            "control loop started"
        );
        let mut observed = Vec::new();
        loop {
            let tick = self.step(experiment).await?;
            observed.push(tick.status);
            let pause = match tick.status {
                status if status.is_terminal() => {
                    info!(experiment = %experiment.id, %status, "experiment terminated");
                    return Ok(observed);
                }
                ExperimentStatus::Running => self.timings.tick,
                ExperimentStatus::Terminating => self.timings.terminating,
                _ => self.timings.idle,
            };
            if !self.pause(pause).await {
                info!(experiment = %experiment.id, "control loop stopped");
                return Ok(observed);
            }
        }
    }

    /// Reload the experiment and act on its status once.
    pub async fn step(&mut self, experiment: &Experiment) -> ControlResult<Tick> {
        let status = self.experiments.reload(experiment).await?.status;
        debug!(experiment = %experiment.id, %status, clients = self.registry.total(), "tick");
        let decision = match status {
            ExperimentStatus::Running => Some(self.scale().await?),
            ExperimentStatus::Terminating => {
                debug!(experiment = %experiment.id, "experiment terminating, no scaling");
                None
            }
            _ => None,
        };
        Ok(Tick { status, decision })
    }

    async fn scale(&mut self) -> ControlResult<ScaleDecision> {
        let server = &self.roles.server;
        let query = MetricQuery {
            hosts: vec![HostRef::new(&server.name, &server.id)],
            kind: Some(NUMERIC),
            ..Default::default()
        };
        let metric = self.monitor.metric(&self.metric, &query).await?;
        let values = metric.numbers().unwrap_or_default();
        let total = self.registry.total();
        let decision = self.policy.evaluate(total, &values);
        info!(metric = %self.metric, ?values, total_clients = total, ?decision, "load sampled");

        match decision {
            ScaleDecision::ScaleUp { average } => {
                warn!(average, total_clients = total, "scaling up");
                let client = self.fleet.provision_client(&mut self.registry, &self.roles).await?;
                let ready = wait_until_reachable(
                    self.fleet.provisioner().repository(),
                    &self.prober,
                    &client,
                    self.timings.readiness_poll,
                )
                .await?;
                info!(client = %ready.name, ip = ?ready.primary_ip(), "client ready");
                self.registry.refresh(&ready);
            }
            ScaleDecision::ScaleDown { average } => {
                warn!(average, total_clients = total, "scaling down");
                if self.fleet.scale_down(&mut self.registry).await.is_none() {
                    debug!("no client to remove");
                }
            }
            ScaleDecision::NoChange => {}
        }
        Ok(decision)
    }

    /// Sleep `duration`. Returns false if shutdown was requested.
    async fn pause(&mut self, duration: Duration) -> bool {
        let Some(shutdown) = self.shutdown.as_mut() else {
            tokio::time::sleep(duration).await;
            return true;
        };
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            changed = shutdown.wait_for(|s| *s) => {
                if changed.is_ok() {
                    return false;
                }
                // Sender gone: nothing can stop the loop any more.
                tokio::time::sleep(duration).await;
                true
            }
        }
    }
}
