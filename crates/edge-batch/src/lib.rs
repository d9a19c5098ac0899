#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The batcher (C5, §4.5): one buffer per destination, flushed on size or
//! age, whichever comes first. Ordering is preserved per source; cross-source
//! ordering at a destination is not guaranteed.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use edge_model::{Batch, QueueRecord};
use edge_signal::{Signal, SignalReceiver};
use tracing::debug;

/// Destination for flushed batches. The stream client (C6) implements this;
/// the batcher is otherwise oblivious to how batches are delivered.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Submits a full batch destined for `destination_id`.
    async fn submit(&self, destination_id: &str, batch: Batch);
}

/// Pure buffering logic: accumulates `QueueRecord`s and decides when a flush
/// is due. Contains no I/O so it is trivially unit-testable.
pub struct Batcher {
    buffer: Vec<QueueRecord>,
    max_records: usize,
    max_age_ms: i64,
}

impl Batcher {
    /// Creates an empty batcher with the given flush thresholds.
    pub fn new(max_records: usize, max_age_ms: i64) -> Self {
        Self { buffer: Vec::new(), max_records, max_age_ms }
    }

    /// Appends `record`. Returns whether the buffer has reached `max_records`
    /// and should be flushed immediately.
    pub fn push(&mut self, record: QueueRecord) -> bool {
        self.buffer.push(record);
        self.buffer.len() >= self.max_records
    }

    /// Whether the oldest buffered record has aged past `max_age_ms` as of
    /// `now_ms`.
    pub fn due(&self, now_ms: i64) -> bool {
        match self.buffer.first() {
            Some(oldest) => now_ms.saturating_sub(oldest.ingest_time_ms) >= self.max_age_ms,
            None => false,
        }
    }

    /// Whether the buffer currently holds no records.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drains the buffer into a `Batch`, or `None` if it was empty.
    pub fn take(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(Batch { records: std::mem::take(&mut self.buffer) })
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Runs one destination's batcher task to completion. Records arrive as
/// `Signal::Messages` (one dequeued-and-routed record per vector, matching
/// the router's handoff granularity); `Signal::TimerTick` drives the age
/// check. The loop exits on `Signal::Stop`, which `SignalReceiver` raises
/// once the sending half of `records` is dropped — flushing whatever is left
/// in the buffer first, per §4.7's graceful-shutdown contract.
pub async fn run_batcher(
    destination_id: String,
    records: flume::Receiver<Vec<QueueRecord>>,
    max_records: usize,
    max_age_ms: i64,
    sink: Arc<dyn BatchSink>,
) {
    let mut batcher = Batcher::new(max_records, max_age_ms);
    let tick_every = Duration::from_millis((max_age_ms.max(1) as u64 / 2).max(50));
    let mut signal_receiver = SignalReceiver::with_receiver_timer(records, tick_every, 0);

    loop {
        match signal_receiver.recv().await {
            Signal::Messages { messages } => {
                let mut should_flush = false;
                for record in messages {
                    should_flush |= batcher.push(record);
                }
                if should_flush {
                    flush(&destination_id, &mut batcher, &sink).await;
                }
            }
            Signal::TimerTick { .. } => {
                if batcher.due(now_ms()) {
                    flush(&destination_id, &mut batcher, &sink).await;
                }
            }
            Signal::Stop => {
                flush(&destination_id, &mut batcher, &sink).await;
                break;
            }
        }
    }
}

async fn flush(destination_id: &str, batcher: &mut Batcher, sink: &Arc<dyn BatchSink>) {
    if let Some(batch) = batcher.take() {
        debug!(%destination_id, records = batch.len(), "flushing batch");
        sink.submit(destination_id, batch).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use edge_model::{DataType, NormalizedTag, Protocol, Quality, RawValue};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn sample(ingest_time_ms: i64) -> QueueRecord {
        QueueRecord {
            tag: NormalizedTag {
                tag_path: "s/a/l/e/signal".into(),
                tag_id: 1,
                data_type: DataType::Float,
                quality: Quality::Good,
                value: RawValue::Float(1.0),
                event_time_ms: ingest_time_ms,
                source_name: "src".into(),
                protocol: Protocol::Mqtt,
                metadata: BTreeMap::new(),
            },
            ingest_time_ms,
        }
    }

    #[test]
    fn flushes_on_max_records() {
        let mut batcher = Batcher::new(2, 10_000);
        assert!(!batcher.push(sample(0)));
        assert!(batcher.push(sample(1)));
        let batch = batcher.take().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batcher.is_empty());
    }

    #[test]
    fn flushes_on_age() {
        let mut batcher = Batcher::new(1000, 100);
        let _ = batcher.push(sample(0));
        assert!(!batcher.due(50));
        assert!(batcher.due(150));
    }

    #[test]
    fn take_on_empty_buffer_is_none() {
        let mut batcher = Batcher::new(10, 1000);
        assert!(batcher.take().is_none());
    }

    struct RecordingSink {
        batches: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn submit(&self, destination_id: &str, batch: Batch) {
            self.batches.lock().unwrap().push((destination_id.to_string(), batch.len()));
        }
    }

    #[tokio::test]
    async fn run_batcher_flushes_on_size_then_stops_cleanly() {
        let (tx, rx) = flume::unbounded();
        let sink = Arc::new(RecordingSink { batches: Mutex::new(Vec::new()) });
        let handle = tokio::spawn(run_batcher("dest-1".to_string(), rx, 2, 60_000, sink.clone()));

        tx.send_async(vec![sample(0)]).await.unwrap();
        tx.send_async(vec![sample(1)]).await.unwrap();
        tx.send_async(vec![sample(2)]).await.unwrap();
        drop(tx);

        handle.await.unwrap();

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], ("dest-1".to_string(), 2));
        assert_eq!(batches[1], ("dest-1".to_string(), 1));
    }
}
