//! cumulus-placement — naming and load balancing of experiment clients.
//!
//! Clients are spread across an ordered list of locations. Scale-up goes
//! to the least-loaded location, scale-down takes the oldest client of the
//! most-loaded one, and ties go to the location listed first.

pub mod naming;
pub mod registry;

pub use naming::{
    aggregator_name, client_name, client_ordinal, client_private_ip, client_suffix,
    private_network_name, server_name,
};
pub use registry::PlacementRegistry;
