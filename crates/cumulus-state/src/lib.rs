//! cumulus-state — resource model and repositories for Cumulus.
//!
//! Experiments own computes and networks; locations carry storages and
//! site networks. Everything the provisioning core does goes through the
//! [`ResourceRepository`] trait, which has two backends:
//!
//! - [`HttpRepository`] talks JSON to the resource API over reqwest.
//! - [`StateStore`] is a [redb](https://docs.rs/redb)-backed simulated
//!   provider used for dry runs and tests.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized, both on the wire and into redb's
//! `&[u8]` value columns. Composite keys (`{experiment_id}:{compute_id}`,
//! `{location_id}:{network_id}`) enable prefix scans for related records.
//!
//! Both backends are `Clone` + `Send` + `Sync` and are shared across async
//! tasks as [`SharedRepository`].

pub mod error;
pub mod http;
pub mod repository;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use http::HttpRepository;
pub use repository::{
    ComputeQuery, ComputeScope, ExperimentQuery, NameMatch, ResourceRepository, SharedRepository,
};
pub use store::{Activation, StateStore};
pub use types::*;
