//! Per-node and per-session execution metrics (C14), surfaced to the host
//! through the `enable_metrics` flag on the FFI boundary. Shape matches the
//! metrics payload every transport sends back verbatim: per-node counters
//! plus one session-level summary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Raw counters for one node, accumulated across every invocation in a run.
#[derive(Default)]
struct NodeMetrics {
    messages_in: u64,
    messages_out: u64,
    failures: u64,
    processing_ns_total: u64,
}

/// A JSON-serializable snapshot of one node's counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NodeMetricsSnapshot {
    pub messages_in: u64,
    pub messages_out: u64,
    pub failures: u64,
    pub avg_ns: u64,
}

/// Pipeline-wide summary: total wall-clock time the metrics aggregator has
/// been alive, and the deepest a channel's buffer was observed to get.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionMetricsSnapshot {
    pub total_ns: u64,
    pub peak_channel_depth: u64,
}

/// The full metrics payload returned to a caller.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub per_node: HashMap<String, NodeMetricsSnapshot>,
    pub session: SessionMetricsSnapshot,
}

/// Aggregates node counters and session-level summary stats across one
/// pipeline execution.
pub struct PipelineMetrics {
    nodes: Mutex<HashMap<String, NodeMetrics>>,
    peak_channel_depth: AtomicU64,
    started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            peak_channel_depth: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

impl PipelineMetrics {
    /// A fresh, empty metrics aggregator, timed from construction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one node invocation: messages consumed/produced, whether it
    /// failed, and wall-clock duration spent in `process`/`process_streaming`
    /// (including time blocked on shared-memory backpressure, which a caller
    /// cares about as much as CPU time).
    pub fn record(&self, node_id: &str, messages_in: u64, messages_out: u64, duration: Duration, failed: bool) {
        let mut nodes = self.nodes.lock();
        let entry = nodes.entry(node_id.to_string()).or_default();
        entry.messages_in += messages_in;
        entry.messages_out += messages_out;
        if failed {
            entry.failures += 1;
        }
        entry.processing_ns_total += duration.as_nanos().min(u64::MAX as u128) as u64;
    }

    /// Note an observed channel buffer depth, keeping the running maximum.
    pub fn record_channel_depth(&self, depth: u64) {
        self.peak_channel_depth.fetch_max(depth, Ordering::Relaxed);
    }

    /// Snapshot all recorded metrics for `enable_metrics` output.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let nodes = self.nodes.lock();
        let per_node = nodes
            .iter()
            .map(|(node_id, m)| {
                let avg_ns = if m.messages_in == 0 {
                    0
                } else {
                    m.processing_ns_total / m.messages_in
                };
                (
                    node_id.clone(),
                    NodeMetricsSnapshot {
                        messages_in: m.messages_in,
                        messages_out: m.messages_out,
                        failures: m.failures,
                        avg_ns,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            per_node,
            session: SessionMetricsSnapshot {
                total_ns: self.started_at.elapsed().as_nanos().min(u64::MAX as u128) as u64,
                peak_channel_depth: self.peak_channel_depth.load(Ordering::Relaxed),
            },
        }
    }
}
