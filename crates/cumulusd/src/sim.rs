//! Simulated mode: a seeded local repository and a synthetic monitor.

use std::f64::consts::PI;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use cumulus_core::CumulusConfig;
use cumulus_metrics::{AUTHENTICATE, RpcTransport, TransportError};
use cumulus_state::{ResourceRepository, StateStore};

/// Interval between synthetic history rows, in seconds.
const SAMPLE_PERIOD: i64 = 60;
/// Period of the synthetic load curve, in seconds.
const LOAD_PERIOD: f64 = 1800.0;

// ── Seeding ────────────────────────────────────────────────────────

/// Make sure every location, image and WAN network the configuration
/// names exists in `store`. Safe to run against an already seeded store.
pub async fn seed(store: &StateStore, config: &CumulusConfig) -> anyhow::Result<()> {
    let fleet = &config.fleet;
    let mut wanted: Vec<(&str, &str)> = vec![
        (fleet.aggregator.location.as_str(), fleet.aggregator.image.as_str()),
        (fleet.server.location.as_str(), fleet.server.image.as_str()),
    ];
    for location in &fleet.clients.locations {
        wanted.push((location.as_str(), fleet.clients.image.as_str()));
    }

    let mut locations: Vec<&str> = Vec::new();
    for &(location, _) in &wanted {
        if !locations.contains(&location) {
            locations.push(location);
        }
    }
    if let Some(private) = &fleet.private_network
        && !locations.contains(&private.location.as_str())
    {
        locations.push(private.location.as_str());
    }

    for (i, location) in locations.iter().enumerate() {
        if store.find_location(location).await?.is_none() {
            store.seed_location(location)?;
            info!(%location, "simulated location created");
        }
        let networks = store.networks(location).await?;
        if !networks.iter().any(|n| n.name == fleet.wan_network) {
            // Private addresses: simulated computes are never probed over SSH.
            let address = format!("192.168.{}.0", 200 + i);
            store.seed_network(location, &fleet.wan_network, Some(address.as_str()))?;
            debug!(%location, %address, "simulated WAN network created");
        }
    }

    for (location, image) in wanted {
        let storages = store.storages(location).await?;
        if !storages.iter().any(|s| s.name == image) {
            store.seed_storage(location, image)?;
            debug!(%location, %image, "simulated image created");
        }
    }
    Ok(())
}

// ── Monitor ────────────────────────────────────────────────────────

/// Answers monitoring calls with a slow sine wave of load.
#[derive(Debug, Default)]
pub struct SimulatedMonitor;

impl SimulatedMonitor {
    fn load_at(clock: i64) -> f64 {
        21.0 + 9.0 * (2.0 * PI * clock as f64 / LOAD_PERIOD).sin()
    }

    /// Rows on the sample grid within `[from, till]`, newest first.
    fn history(from: i64, till: i64) -> Value {
        let first = from.div_euclid(SAMPLE_PERIOD) * SAMPLE_PERIOD;
        let first = if first < from { first + SAMPLE_PERIOD } else { first };
        let mut rows = Vec::new();
        let mut clock = first;
        while clock <= till {
            rows.push(json!({
                "itemid": "1",
                "clock": clock.to_string(),
                "value": format!("{:.4}", Self::load_at(clock)),
            }));
            clock += SAMPLE_PERIOD;
        }
        rows.reverse();
        Value::Array(rows)
    }
}

#[async_trait]
impl RpcTransport for SimulatedMonitor {
    async fn post(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let request: Value = serde_json::from_slice(&body)
            .map_err(|e| TransportError::Request(format!("malformed request: {e}")))?;
        let method = request["method"].as_str().unwrap_or_default();
        let result = match method {
            AUTHENTICATE => json!("simulated-token"),
            "item.get" => json!([{"itemid": "1"}]),
            "history.get" => {
                let from = request["params"]["time_from"].as_i64().unwrap_or(0);
                let till = request["params"]["time_till"].as_i64().unwrap_or(from);
                Self::history(from, till)
            }
            _ => json!([]),
        };
        let response = json!({"jsonrpc": "2.0", "id": request["id"], "result": result});
        serde_json::to_vec(&response).map_err(|e| TransportError::Request(e.to_string()))
    }
}
