//! Bridge-wide metrics (§4.7 `get_metrics`, §7 status surface), mirroring the
//! counters `UnifiedBridge.metrics` tracks in the original implementation:
//! `records_received`, `records_normalized`, `records_enqueued`,
//! `records_dropped`, `batches_sent`, `reconnections`.

use std::sync::atomic::AtomicU64;

/// Atomic counters updated from many contexts concurrently (§5).
#[derive(Default)]
pub struct BridgeMetricsInner {
    /// Records observed from any source.
    pub records_received: AtomicU64,
    /// Records successfully normalized (including fallback-shaped records).
    pub records_normalized: AtomicU64,
    /// Records accepted by the backpressure queue.
    pub records_enqueued: AtomicU64,
    /// Records dropped under the overflow policy, or unroutable.
    pub records_dropped: AtomicU64,
    /// Batches successfully sent to any destination.
    pub batches_sent: AtomicU64,
    /// Reconnection attempts across all sources.
    pub reconnections: AtomicU64,
}

/// A point-in-time snapshot of `BridgeMetricsInner` (§4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeMetrics {
    /// Records observed from any source.
    pub records_received: u64,
    /// Records successfully normalized.
    pub records_normalized: u64,
    /// Records accepted by the backpressure queue.
    pub records_enqueued: u64,
    /// Records dropped under the overflow policy, or unroutable.
    pub records_dropped: u64,
    /// Batches successfully sent to any destination.
    pub batches_sent: u64,
    /// Reconnection attempts across all sources.
    pub reconnections: u64,
}
