//! cumulus-scheduler — provisioning of an experiment's machines.
//!
//! Finds or creates the experiment and every machine in it by
//! deterministic name, so a run can be restarted against a live
//! experiment without duplicating anything. The scheduler:
//!
//! - Finds, transitions and cleans up experiments
//! - Finds or creates computes and networks under an experiment
//! - Provisions the aggregator, server and clients of a fleet
//! - Waits for computes to become active and reachable
//!
//! # Architecture
//!
//! ```text
//! ExperimentManager ── ResourceRepository
//! Fleet
//!   ├── Provisioner (find-or-create by name)
//!   └── PlacementRegistry (least/most-loaded location)
//! readiness::wait_until_ready
//!   ├── ResourceRepository (reload each round)
//!   └── ReadinessProber
//! ```

pub mod error;
pub mod experiment;
pub mod fleet;
pub mod provisioner;
pub mod readiness;

pub use error::{SchedulerError, SchedulerResult};
pub use experiment::{CleanupOutcome, ExperimentManager};
pub use fleet::{Fleet, Roles};
pub use provisioner::Provisioner;
pub use readiness::{wait_until_reachable, wait_until_ready};
