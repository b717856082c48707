//! cumulus-autoscale — metric-driven client scaling.
//!
//! Samples the server's load metric every tick and grows or shrinks the
//! client set one machine at a time.
//!
//! # Scaling Algorithm
//!
//! ```text
//! window = last 6 samples, oldest first
//!
//! if clients <= 10 and avg(last 3) <= 20:
//!     add a client at the least-loaded location, wait until reachable
//! elif clients > 1 and avg(last 5) >= 22:
//!     remove the oldest client of the most-loaded location
//! ```
//!
//! Ticks are 60s while running, 30s while terminating and 60s otherwise.
//! The loop ends on `terminated` or `canceled`.

pub mod control;
pub mod error;
pub mod policy;

pub use control::{ControlLoop, Tick};
pub use error::{ControlError, ControlResult};
pub use policy::{ScaleDecision, ScalingPolicy};
