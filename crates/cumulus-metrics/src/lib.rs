//! cumulus-metrics — monitoring service client for Cumulus.
//!
//! Speaks the monitoring service's JSON-RPC dialect over HTTP POST and
//! turns `history.get` results into oldest-first [`Metric`] series for the
//! autoscaler.
//!
//! # Architecture
//!
//! ```text
//! MonitorClient
//!   ├── authenticate()            → token (lazy, cleared on "Not authorized")
//!   ├── request(method, params)   → result | MonitorError
//!   │     └── RpcTransport::post  (retried forever on transport failure)
//!   └── metric(name, query)       → item.get + history.get → Metric
//!
//! stats: sum / average / median / tail_average
//! ```

pub mod client;
pub mod error;
pub mod metric;
pub mod stats;
pub mod transport;

pub use client::{AUTHENTICATE, HostRef, MetricQuery, MonitorClient};
pub use error::{MonitorError, MonitorResult, RpcError, TransportError};
pub use metric::{Metric, MetricValue, NUMERIC, Sample};
pub use transport::{HttpTransport, RpcTransport};
