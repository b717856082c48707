//! cumulus-health — readiness probing for Cumulus computes.
//!
//! Opens SSH sessions to a compute's interfaces (through a gateway when
//! one is configured) and reports whether the machine answers.
//!
//! # Architecture
//!
//! ```text
//! ReadinessProber
//!   ├── is_reachable(compute)
//!   │   ├── NIC without address / private address → reachable, no probe
//!   │   ├── other NIC → run(ip, "hostname") within the probe timeout
//!   │   └── memo: compute id → first reachable address
//!   └── run(host, user, options, action)   (session always closed)
//!         └── SessionConnector
//!               └── SshConnector (russh, optional gateway tunnel)
//! ```

pub mod prober;
pub mod session;
pub mod ssh;

pub use prober::{BoxFuture, ReadinessProber};
pub use session::{
    CommandOutput, ProbeError, RemoteSession, SessionConnector, SessionOptions, SessionResult,
    SessionTarget,
};
pub use ssh::{GatewayConfig, SshConnector};
