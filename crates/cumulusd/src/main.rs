//! cumulusd — the Cumulus daemon.
//!
//! Single binary that drives one experiment end to end:
//! - Resource repository (REST API, or a local simulated store)
//! - Experiment, aggregator, server and client provisioning
//! - Readiness barrier over SSH
//! - Monitoring client and autoscaling loop
//! - Failure handler with an interruptible cleanup
//!
//! # Usage
//!
//! ```text
//! cumulusd --config cumulus.toml run
//! cumulusd --config cumulus.toml --simulate /tmp/sim.redb run --delete-on-exit
//! cumulusd --config cumulus.toml exec --compute server-experiment42 -- uptime
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod backend;
mod exec;
mod scenario;
mod sim;

const DEFAULT_FILTER: &str = "info,cumulusd=debug,cumulus=debug";

#[derive(Parser)]
#[command(name = "cumulusd", about = "Cumulus elastic experiment daemon")]
struct Cli {
    /// Configuration file.
    #[arg(long, short, global = true, default_value = "cumulus.toml")]
    config: PathBuf,

    /// Use a simulated repository stored at this path instead of the resource API.
    #[arg(long, global = true)]
    simulate: Option<PathBuf>,

    /// Log filter; overrides RUST_LOG.
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the experiment and run the autoscaling loop until it ends.
    Run {
        /// Delete the experiment when the loop ends normally.
        #[arg(long)]
        delete_on_exit: bool,
    },
    /// Run a command on a compute of the running experiment.
    Exec {
        /// Compute name.
        #[arg(long)]
        compute: String,

        /// Copy a local file first, as LOCAL:REMOTE.
        #[arg(long)]
        upload: Option<String>,

        /// Command to run.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cumulus_core::CumulusConfig::from_file(&cli.config)?;
    let backend = backend::Backend::open(&config, cli.simulate.as_deref()).await?;

    match cli.command {
        Command::Run { delete_on_exit } => scenario::run(&config, &backend, delete_on_exit).await,
        Command::Exec {
            compute,
            upload,
            command,
        } => exec::run(&config, &backend, &compute, upload.as_deref(), &command.join(" ")).await,
    }
}
