//! Wires one destination's batcher (C5) to the stream client (C6): a
//! `BatchSink` that resolves the destination's id to its full `Destination`
//! record and tracks the in-flight-batch count `get_status()` reports (§7).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use edge_batch::BatchSink;
use edge_model::{Batch, Destination};
use edge_stream::StreamClient;
use tokio::sync::Mutex;
use tracing::error;

use crate::metrics::BridgeMetricsInner;

/// The `BatchSink` each destination's `run_batcher` task submits into.
pub struct DestinationSink {
    destination: Destination,
    stream_client: Arc<StreamClient>,
    metrics: Arc<BridgeMetricsInner>,
    in_flight: AtomicU32,
    last_error: Mutex<Option<String>>,
    last_success_time_ms: AtomicU64,
}

impl DestinationSink {
    /// Creates a sink bound to `destination`, submitting through `stream_client`.
    pub fn new(destination: Destination, stream_client: Arc<StreamClient>, metrics: Arc<BridgeMetricsInner>) -> Self {
        Self {
            destination,
            stream_client,
            metrics,
            in_flight: AtomicU32::new(0),
            last_error: Mutex::new(None),
            last_success_time_ms: AtomicU64::new(0),
        }
    }

    /// Number of batches currently being sent (§7 `get_status`).
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// The last send error observed, if any (§7 `destination.Y.error`).
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.lock().await.clone()
    }
}

#[async_trait]
impl BatchSink for DestinationSink {
    async fn submit(&self, destination_id: &str, batch: Batch) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.stream_client.send_batch(&self.destination, &batch).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        let mut last_error = self.last_error.lock().await;
        match result {
            Ok(()) => {
                *last_error = None;
                self.last_success_time_ms.store(now_ms(), Ordering::Relaxed);
                self.metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                error!(%destination_id, reason = %err, "batch send failed");
                *last_error = Some(err.to_string());
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
