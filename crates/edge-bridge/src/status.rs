//! Point-in-time status types returned by `get_status()` and
//! `get_pipeline_diagnostics()` (§4.7, §7).

use std::collections::HashMap;

use edge_model::{CircuitBreakerState, Protocol};
use edge_queue::QueueMetrics;
use edge_stream::StreamMetrics;

/// Health of one source (§7: "last error string, last successful event time").
#[derive(Debug, Clone)]
pub struct SourceStatus {
    /// The protocol this source speaks.
    pub protocol: Protocol,
    /// Whether currently connected.
    pub connected: bool,
    /// Milliseconds since the epoch of the last successful connect.
    pub last_connect_time_ms: Option<i64>,
    /// Milliseconds since the epoch of the last disconnect.
    pub last_disconnect_time_ms: Option<i64>,
    /// Consecutive reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// The last error observed, if any.
    pub last_error: Option<String>,
}

/// Health of one destination (§7: "circuit-breaker state, queue depth, spool
/// depth, and in-flight batch count" as it pertains to this destination).
#[derive(Debug, Clone)]
pub struct DestinationStatus {
    /// Current circuit breaker state.
    pub circuit: CircuitBreakerState,
    /// Batches currently being sent.
    pub in_flight_batches: u32,
    /// The last send error observed, if any.
    pub last_error: Option<String>,
    /// Cumulative send metrics for this destination.
    pub metrics: StreamMetrics,
}

/// A full point-in-time status snapshot (§4.7 `get_status`).
#[derive(Debug, Clone, Default)]
pub struct BridgeStatus {
    /// Per-source health, keyed by source name.
    pub sources: HashMap<String, SourceStatus>,
    /// Per-destination health, keyed by destination id.
    pub destinations: HashMap<String, DestinationStatus>,
}

/// A deeper diagnostic snapshot, layering queue internals on top of
/// `BridgeStatus` (§6 outbound control API: `get_pipeline_diagnostics`).
#[derive(Debug)]
pub struct PipelineDiagnostics {
    /// The same per-source/per-destination health `get_status()` reports.
    pub status: BridgeStatus,
    /// Backpressure queue internals: memory depth, spool depth, drop count.
    pub queue: QueueMetrics,
}
