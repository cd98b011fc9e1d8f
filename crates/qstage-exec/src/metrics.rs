//! Metrics/tracing hooks.
//!
//! The runtime records per-operator row counts into [`RunMetrics`] and emits
//! each measurement through [`emit_span`]. Wire these up to a real telemetry
//! stack in the binary layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorMetrics {
    pub node: String,
    pub partitions: usize,
    pub rows: u64,
}

/// Counters for one execution of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// In completion order (children before parents).
    pub operators: Vec<OperatorMetrics>,
    /// Exchanges whose output was served from the per-run cache.
    pub exchanges_reused: u64,
    /// Subqueries whose rows were served from the per-run cache.
    pub subqueries_reused: u64,
    /// Table partitions skipped by partition filters.
    pub partitions_pruned: u64,
}

impl RunMetrics {
    pub fn record(&mut self, node: &str, partitions: usize, rows: u64) {
        emit_span(
            "operator",
            &[
                ("node", node.to_string()),
                ("partitions", partitions.to_string()),
                ("rows", rows.to_string()),
            ],
        );
        self.operators.push(OperatorMetrics {
            node: node.to_string(),
            partitions,
            rows,
        });
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(feature = "tracing")]
pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "qstage_exec", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn emit_span(_event: &str, _key_values: &[(&str, String)]) { /* no-op */
}
