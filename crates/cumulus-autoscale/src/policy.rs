//! Scaling policy: thresholds over the most recent metric samples.

use tracing::debug;

use cumulus_core::ScalingConfig;
use cumulus_metrics::stats::tail_average;

/// A scaling decision for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleDecision {
    /// Add one client; carries the average that triggered it.
    ScaleUp { average: f64 },
    /// Remove one client; carries the average that triggered it.
    ScaleDown { average: f64 },
    NoChange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    /// Scale-up is allowed while the client count is at most this.
    pub max_clients: usize,
    /// Scale-down is allowed while the client count is above this.
    pub min_clients: usize,
    pub scale_up_below: f64,
    pub scale_down_above: f64,
    pub scale_up_samples: usize,
    pub scale_down_samples: usize,
    /// Only this many of the most recent samples are considered.
    pub sample_window: usize,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::from(&ScalingConfig::default())
    }
}

impl From<&ScalingConfig> for ScalingPolicy {
    fn from(config: &ScalingConfig) -> Self {
        Self {
            max_clients: config.max_clients,
            min_clients: config.min_clients,
            scale_up_below: config.scale_up_below,
            scale_down_above: config.scale_down_above,
            scale_up_samples: config.scale_up_samples,
            scale_down_samples: config.scale_down_samples,
            sample_window: config.sample_window,
        }
    }
}

impl ScalingPolicy {
    /// Decide what to do with `total_clients` clients given `values`,
    /// ordered oldest to newest.
    ///
    /// Scale-up wins when both conditions hold.
    pub fn evaluate(&self, total_clients: usize, values: &[f64]) -> ScaleDecision {
        let window = &values[values.len().saturating_sub(self.sample_window)..];
        let up_avg = tail_average(window, self.scale_up_samples);
        let down_avg = tail_average(window, self.scale_down_samples);
        debug!(total_clients, ?window, ?up_avg, ?down_avg, "evaluating load");

        if total_clients <= self.max_clients
            && let Some(average) = up_avg
            && average <= self.scale_up_below
        {
            return ScaleDecision::ScaleUp { average };
        }
        if total_clients > self.min_clients
            && let Some(average) = down_avg
            && average >= self.scale_down_above
        {
            return ScaleDecision::ScaleDown { average };
        }
        ScaleDecision::NoChange
    }
}
