//! `exec` mode: run a command on one compute of the running experiment.

use anyhow::{Context, anyhow, bail};
use tracing::{debug, info};

use cumulus_core::CumulusConfig;
use cumulus_state::{ComputeQuery, ExperimentQuery, ExperimentStatus, ResourceRepository};

use crate::backend::Backend;

pub async fn run(
    config: &CumulusConfig,
    backend: &Backend,
    compute: &str,
    upload: Option<&str>,
    command: &str,
) -> anyhow::Result<()> {
    let query = ExperimentQuery::named(&config.experiment.name).with_status(ExperimentStatus::Running);
    let experiment = backend
        .repo
        .find_experiments(&query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no running experiment named {:?}", config.experiment.name))?;

    let target = backend
        .repo
        .find_computes(&ComputeQuery::in_experiment(&experiment.id).named(compute))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no compute {compute:?} in experiment {}", experiment.id))?;

    let prober = backend.prober(config)?;
    if !prober.is_reachable(&target).await {
        bail!("compute {} is not reachable", target.name);
    }
    let host = prober
        .reachable_address(&target)
        .or_else(|| target.primary_ip().map(str::to_string))
        .ok_or_else(|| anyhow!("compute {} has no address", target.name))?;

    let upload = match upload {
        Some(spec) => {
            let (local, remote) = spec
                .split_once(':')
                .ok_or_else(|| anyhow!("--upload expects LOCAL:REMOTE, got {spec:?}"))?;
            let contents = tokio::fs::read(local)
                .await
                .with_context(|| format!("reading {local}"))?;
            Some((contents, remote.to_string()))
        }
        None => None,
    };

    info!(compute = %target.name, %host, %command, "running command");
    let command = command.to_string();
    let output = prober
        .run(&host, prober.user(), prober.options(), move |session| {
            Box::pin(async move {
                if let Some((contents, remote)) = upload {
                    if let Err(e) = session.upload(&contents, &remote).await {
                        return Err(e);
                    }
                    debug!(%remote, bytes = contents.len(), "file uploaded");
                }
                session.exec(&command).await
            })
        })
        .await?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    if !output.success() {
        bail!("command exited with code {}", output.exit_code);
    }
    Ok(())
}
