//! Metric history as returned by `history.get`.

use serde_json::Value;
use tracing::debug;

/// History type codes whose values are numbers (float and unsigned).
const NUMERIC_KINDS: [u32; 2] = [0, 3];

/// Wire code for numeric float history.
pub const NUMERIC: u32 = 0;

/// One history row.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Unix timestamp of the sample, when the row carries one.
    pub clock: Option<i64>,
    pub value: Value,
}

/// A sample value after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Raw(Value),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Raw(_) => None,
        }
    }
}

/// A named time series, oldest sample first.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    /// Declared history type, if the caller asked for one.
    pub kind: Option<u32>,
    samples: Vec<Sample>,
}

impl Metric {
    /// Build from a `history.get` result.
    ///
    /// The wire order (newest first) is reversed and nothing else: rows of
    /// one item stay together when the result spans several items.
    pub fn from_history(name: impl Into<String>, kind: Option<u32>, result: &Value) -> Self {
        let samples: Vec<Sample> = result
            .as_array()
            .map(|rows| rows.iter().rev().map(sample_from_row).collect())
            .unwrap_or_default();
        Self {
            name: name.into(),
            kind,
            samples,
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_numeric(&self) -> bool {
        self.kind.is_some_and(|k| NUMERIC_KINDS.contains(&k))
    }

    /// Values oldest to newest, coerced to numbers for numeric kinds.
    pub fn values(&self) -> Vec<MetricValue> {
        let numeric = self.is_numeric();
        self.samples
            .iter()
            .map(|s| {
                if numeric {
                    MetricValue::Number(coerce(&s.value))
                } else {
                    MetricValue::Raw(s.value.clone())
                }
            })
            .collect()
    }

    /// Numeric values oldest to newest, or `None` for non-numeric kinds.
    pub fn numbers(&self) -> Option<Vec<f64>> {
        if !self.is_numeric() {
            return None;
        }
        Some(self.samples.iter().map(|s| coerce(&s.value)).collect())
    }
}

fn sample_from_row(row: &Value) -> Sample {
    let clock = row.get("clock").and_then(|c| match c {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    Sample {
        clock,
        value: row.get("value").cloned().unwrap_or(Value::Null),
    }
}

/// Numeric reading of a wire value. Unparsable text reads as 0.0.
fn coerce(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or_else(|_| {
            debug!(value = %s, "non-numeric sample read as 0");
            0.0
        }),
        _ => 0.0,
    }
}
