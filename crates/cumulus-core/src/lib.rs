//! cumulus-core — configuration model shared by the Cumulus crates.
//!
//! The daemon reads a single `cumulus.toml` describing the resource API,
//! SSH access, the monitoring service, the experiment, the fleet layout
//! and the scaling policy. Library crates receive the already-resolved
//! values; only `cumulusd` touches the file.

pub mod config;
pub mod duration;

pub use config::*;
pub use duration::parse_duration;
