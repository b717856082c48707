//! redb table definitions for the simulated resource store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Experiments keyed by `{experiment_id}`.
pub const EXPERIMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("experiments");

/// Compute resources keyed by `{experiment_id}:{compute_id}`.
pub const COMPUTES: TableDefinition<&str, &[u8]> = TableDefinition::new("computes");

/// Locations keyed by `{location_id}`.
pub const LOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("locations");

/// Storages keyed by `{location_id}:{storage_id}`.
pub const STORAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("storages");

/// Networks keyed by `{location_id}:{network_id}`.
pub const NETWORKS: TableDefinition<&str, &[u8]> = TableDefinition::new("networks");

/// Monotonic counters keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Shape shared by every JSON-valued table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
