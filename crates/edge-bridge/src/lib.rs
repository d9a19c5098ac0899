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

//! The bridge (C7, §4.7): owns every other component and exposes the
//! process's public lifecycle and status API. Grounded on `UnifiedBridge` in
//! the original implementation for the orchestration sequence (`start()`
//! materializes destinations before sources; `stop()` reverses the order),
//! and on the teacher's `Command`/`CommandHandler` split for the idea of a
//! narrow control surface distinct from the data plane — here expressed
//! directly as async methods on `Bridge` rather than a message-passed
//! command enum, since every caller already has an async context.

mod destination;
mod metrics;
mod protocol_config;
mod source;
mod status;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use edge_config::{BridgeConfig, DestinationConfig, SourceConfig};
use edge_model::{is_path_safe_name, Destination, QueueRecord};
use edge_normalize::{IsaPathNormalizer, NormalizationErrorCounter, Normalizer};
use edge_queue::{BackpressureQueue, QueueConfig};
use edge_router::route;
use edge_stream::circuit::CircuitBreakerConfig as StreamCircuitBreakerConfig;
use edge_stream::token::OAuth2TokenProvider;
use edge_stream::{BatchTransport, HttpBatchTransport, RetryConfig as StreamRetryConfig, StreamClient};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use destination::DestinationSink;
pub use metrics::{BridgeMetrics, BridgeMetricsInner};
pub use source::SourceEntry;
pub use status::{BridgeStatus, DestinationStatus, PipelineDiagnostics, SourceStatus};

/// Errors returned by the bridge's public API.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The backpressure queue could not be opened.
    #[error("queue error: {0}")]
    Queue(#[from] edge_queue::Error),
    /// `protocol_params` did not match the shape the protocol expects.
    #[error("invalid protocol_params for source '{source_name}': {reason}")]
    InvalidProtocolParams {
        /// The offending source.
        source_name: String,
        /// Why parsing failed.
        reason: String,
    },
    /// `add_source` was called with a name already in use.
    #[error("source '{0}' already exists")]
    DuplicateSource(String),
    /// `remove_source`/`get_status` referenced a source that is not running.
    #[error("source '{0}' is not known")]
    UnknownSource(String),
    /// A source name failed the process-wide path-safety check (§3).
    #[error("source name '{0}' is not path-safe")]
    UnsafeSourceName(String),
    /// `start_destination`/`stop_destination` referenced an unknown destination.
    #[error("destination '{0}' is not known")]
    UnknownDestination(String),
}

struct DestinationEntry {
    destination: Destination,
    records_tx: flume::Sender<Vec<QueueRecord>>,
    batcher_handle: JoinHandle<()>,
    sink: Arc<DestinationSink>,
}

/// A struct implementing `Normalizer` that always produces the §4.2 raw
/// fallback shape, used when `normalization.enabled = false`.
struct PassthroughNormalizer;

impl Normalizer for PassthroughNormalizer {
    fn normalize(&self, raw: &edge_model::RawRecord) -> edge_model::NormalizedTag {
        let tag_path = format!("raw/{}/{}", raw.source_name, raw.topic_or_path);
        edge_model::NormalizedTag {
            tag_id: edge_normalize::tag_id(&tag_path),
            tag_path,
            data_type: edge_model::DataType::String,
            quality: edge_model::Quality::Good,
            value: raw.value.clone(),
            event_time_ms: raw.event_time_ms,
            source_name: raw.source_name.clone(),
            protocol: raw.protocol,
            metadata: raw.metadata.clone(),
        }
    }
}

/// The orchestrator: owns the queue, the normalizer, the stream client, every
/// running source supervisor, and every running destination batcher.
pub struct Bridge {
    config: Arc<RwLock<BridgeConfig>>,
    queue: Arc<BackpressureQueue>,
    normalizer: Arc<dyn Normalizer>,
    normalization_errors: Arc<NormalizationErrorCounter>,
    stream_client: Arc<StreamClient>,
    sources: RwLock<HashMap<String, SourceEntry>>,
    destinations: Arc<RwLock<HashMap<String, DestinationEntry>>>,
    metrics: Arc<BridgeMetricsInner>,
    dispatch: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Bridge {
    /// Builds the bridge's static collaborators (queue, normalizer, stream
    /// client) from `config`. Nothing is started until `start()` is called.
    pub fn new(config: BridgeConfig, credential_store: Arc<dyn edge_credentials::CredentialStore>) -> Result<Self, Error> {
        let queue_config = QueueConfig {
            max_in_memory: config.backpressure.max_in_memory,
            drop_policy: config.backpressure.drop_policy,
            spool_enabled: config.backpressure.spool_enabled,
            spool_dir: config.backpressure.spool_dir.clone().into(),
            spool_max_bytes: config.backpressure.spool_max_bytes,
        };
        let queue = Arc::new(BackpressureQueue::open(queue_config)?);

        let normalizer: Arc<dyn Normalizer> = if config.normalization.enabled {
            Arc::new(IsaPathNormalizer::new(
                config.normalization.site.clone(),
                config.normalization.area.clone(),
                config.normalization.line.clone(),
                config.normalization.equipment.clone(),
            ))
        } else {
            Arc::new(PassthroughNormalizer)
        };

        let transport: Arc<dyn BatchTransport> = Arc::new(HttpBatchTransport::new());
        let stream_client = Arc::new(StreamClient::new(
            transport,
            Arc::new(OAuth2TokenProvider::new()),
            credential_store,
            StreamRetryConfig {
                initial_delay: std::time::Duration::from_millis(config.retry.initial_backoff_ms),
                max_delay: std::time::Duration::from_millis(config.retry.max_backoff_ms),
                multiplier: config.retry.multiplier,
                max_attempts: config.retry.max_attempts,
            },
            StreamCircuitBreakerConfig {
                failure_threshold: config.circuit_breaker.failure_threshold,
                cooldown: std::time::Duration::from_millis(config.circuit_breaker.cooldown_ms.max(0) as u64),
                half_open_max_probes: config.circuit_breaker.half_open_max_probes,
                half_open_required_successes: config.circuit_breaker.half_open_required_successes,
            },
        ));

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            queue,
            normalizer,
            normalization_errors: Arc::new(NormalizationErrorCounter::new()),
            stream_client,
            sources: RwLock::new(HashMap::new()),
            destinations: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(BridgeMetricsInner::default()),
            dispatch: Mutex::new(None),
        })
    }

    /// Starts every configured destination, then every enabled source, then
    /// the dispatch loop that routes dequeued records to their destination's
    /// batcher (§4.7 `start()`).
    pub async fn start(&self) -> Result<(), Error> {
        info!("starting bridge");
        let destination_configs: Vec<(String, DestinationConfig)> =
            self.config.read().await.destinations.iter().map(|(id, cfg)| (id.clone(), cfg.clone())).collect();
        for (id, cfg) in destination_configs {
            self.start_destination_inner(&id, &cfg).await?;
        }

        let source_configs: Vec<SourceConfig> = self.config.read().await.sources.values().cloned().collect();
        for source in source_configs {
            if !source.enabled {
                info!(source = %source.source_name, "source disabled, skipping");
                continue;
            }
            self.start_source_inner(source).await?;
        }

        self.start_dispatch_loop().await;
        info!(sources = self.sources.read().await.len(), "bridge started");
        Ok(())
    }

    /// Signals every supervisor and batcher to stop, then awaits them,
    /// flushing each destination's buffer first (§4.7 `stop()`).
    pub async fn stop(&self) {
        info!("stopping bridge");

        if let Some((stop_tx, handle)) = self.dispatch.lock().await.take() {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }

        let sources: Vec<(String, SourceEntry)> = self.sources.write().await.drain().collect();
        for (name, entry) in sources {
            let _ = entry.stop_tx.send(true);
            let _ = entry.handle.await;
            debug!(source = %name, "source stopped");
        }

        let destinations: Vec<(String, DestinationEntry)> = self.destinations.write().await.drain().collect();
        for (id, entry) in destinations {
            drop(entry.records_tx);
            let _ = entry.batcher_handle.await;
            debug!(destination = %id, "destination stopped");
        }

        info!("bridge stopped");
    }

    /// Registers and starts a new source (§4.7 `add_source`).
    pub async fn add_source(&self, name: String, protocol: edge_model::Protocol, endpoint: String, protocol_params: serde_yaml::Value) -> Result<(), Error> {
        if !is_path_safe_name(&name) {
            return Err(Error::UnsafeSourceName(name));
        }
        if self.sources.read().await.contains_key(&name) {
            return Err(Error::DuplicateSource(name));
        }

        let config = SourceConfig {
            source_name: name.clone(),
            protocol,
            endpoint,
            enabled: true,
            routing_hint: None,
            protocol_params,
        };
        self.config.write().await.sources.insert(name, config.clone());
        self.start_source_inner(config).await
    }

    /// Stops and deregisters a source (§4.7 `remove_source`).
    pub async fn remove_source(&self, name: &str) -> Result<(), Error> {
        let entry = self.sources.write().await.remove(name).ok_or_else(|| Error::UnknownSource(name.to_string()))?;
        let _ = entry.stop_tx.send(true);
        let _ = entry.handle.await;
        let _ = self.config.write().await.sources.remove(name);
        Ok(())
    }

    /// Brings one destination's batcher and stream handle up without
    /// touching any source (§4.7 `start_destination`).
    pub async fn start_destination(&self, destination_id: &str) -> Result<(), Error> {
        let cfg = self
            .config
            .read()
            .await
            .destinations
            .get(destination_id)
            .cloned()
            .ok_or_else(|| Error::UnknownDestination(destination_id.to_string()))?;
        self.start_destination_inner(destination_id, &cfg).await
    }

    /// Flushes and stops one destination's batcher without touching any
    /// source; records routed to it keep accumulating in the queue until it
    /// is started again (§4.7 `stop_destination`). Once `entry` is removed
    /// here the dispatch loop can no longer resolve this id to a sender (it
    /// looks `destinations` up fresh on every dequeued record rather than
    /// holding its own clone), so dropping `entry.records_tx` is the last
    /// live sender and the batcher's channel disconnects for good.
    pub async fn stop_destination(&self, destination_id: &str) -> Result<(), Error> {
        let entry = self
            .destinations
            .write()
            .await
            .remove(destination_id)
            .ok_or_else(|| Error::UnknownDestination(destination_id.to_string()))?;
        drop(entry.records_tx);
        let _ = entry.batcher_handle.await;
        Ok(())
    }

    /// Point-in-time per-source and per-destination health (§4.7 `get_status`).
    pub async fn get_status(&self) -> BridgeStatus {
        let mut sources = HashMap::new();
        for (name, entry) in self.sources.read().await.iter() {
            let status = entry.status_rx.borrow().clone();
            sources.insert(
                name.clone(),
                SourceStatus {
                    protocol: entry.config.protocol,
                    connected: status.connected,
                    last_connect_time_ms: status.last_connect_time_ms,
                    last_disconnect_time_ms: status.last_disconnect_time_ms,
                    reconnect_attempts: status.reconnect_attempts,
                    last_error: status.last_error,
                },
            );
        }

        let mut destinations = HashMap::new();
        for (id, entry) in self.destinations.read().await.iter() {
            destinations.insert(
                id.clone(),
                DestinationStatus {
                    circuit: self.stream_client.circuit_state(id).await,
                    in_flight_batches: entry.sink.in_flight(),
                    last_error: entry.sink.last_error().await,
                    metrics: self.stream_client.metrics_for(id).await,
                },
            );
        }

        BridgeStatus { sources, destinations }
    }

    /// Point-in-time bridge-wide counters (§4.7 `get_metrics`).
    pub fn get_metrics(&self) -> BridgeMetrics {
        BridgeMetrics {
            records_received: self.metrics.records_received.load(Ordering::Relaxed),
            records_normalized: self.metrics.records_normalized.load(Ordering::Relaxed),
            records_enqueued: self.metrics.records_enqueued.load(Ordering::Relaxed),
            records_dropped: self.metrics.records_dropped.load(Ordering::Relaxed),
            batches_sent: self.metrics.batches_sent.load(Ordering::Relaxed),
            reconnections: self.metrics.reconnections.load(Ordering::Relaxed),
        }
    }

    /// `get_status()` layered with backpressure queue internals (§6).
    pub async fn get_pipeline_diagnostics(&self) -> PipelineDiagnostics {
        PipelineDiagnostics { status: self.get_status().await, queue: self.queue.metrics() }
    }

    async fn start_source_inner(&self, config: SourceConfig) -> Result<(), Error> {
        let entry = source::spawn(config, self.queue.clone(), self.normalizer.clone(), self.normalization_errors.clone(), self.metrics.clone())?;
        let name = entry.config.source_name.clone();
        let _ = self.sources.write().await.insert(name, entry);
        Ok(())
    }

    async fn start_destination_inner(&self, destination_id: &str, cfg: &DestinationConfig) -> Result<(), Error> {
        let destination = cfg.to_destination();
        let sink = Arc::new(DestinationSink::new(destination.clone(), self.stream_client.clone(), self.metrics.clone()));
        let (records_tx, records_rx) = flume::unbounded();

        let batch_config = self.config.read().await.batch.clone();
        let sink_for_task = sink.clone();
        let destination_id_owned = destination_id.to_string();
        let batcher_handle = tokio::spawn(edge_batch::run_batcher(
            destination_id_owned,
            records_rx,
            batch_config.max_records,
            batch_config.max_age_ms,
            sink_for_task as Arc<dyn edge_batch::BatchSink>,
        ));

        let _ = self.destinations.write().await.insert(
            destination_id.to_string(),
            DestinationEntry { destination, records_tx, batcher_handle, sink },
        );
        Ok(())
    }

    /// The single shared router/dispatch task (§4.4): dequeues from the
    /// backpressure queue and forwards into the routed destination's batcher
    /// channel. `config` and `destinations` are the bridge's own shared
    /// state, not a point-in-time copy — every dequeued record looks both up
    /// fresh, so a destination brought up or down by `start_destination`/
    /// `stop_destination` after the loop started is visible on the very next
    /// record, per §4.7's "safe to call concurrently with the pipeline
    /// running" contract.
    async fn start_dispatch_loop(&self) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let queue = self.queue.clone();
        let destinations = self.destinations.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();

        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let dequeued = tokio::select! {
                    record = queue.dequeue() => record,
                    _ = stop_rx.changed() => break,
                };
                let Some(record) = dequeued else { continue };

                let (hint, default_destination) = {
                    let config = config.read().await;
                    let hint = config.sources.get(&record.tag.source_name).and_then(|cfg| cfg.routing_hint.clone());
                    (hint, config.routing.default_destination.clone())
                };

                match route(hint.as_deref(), default_destination.as_deref()) {
                    edge_router::RouteOutcome::Routed(destination_id) => {
                        let sender = destinations.read().await.get(&destination_id).map(|entry| entry.records_tx.clone());
                        match sender {
                            Some(sender) => {
                                if sender.send_async(vec![record]).await.is_err() {
                                    metrics.records_dropped.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            None => {
                                warn!(%destination_id, "routed to a destination with no running batcher, dropping");
                                metrics.records_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    edge_router::RouteOutcome::Unroutable => {
                        metrics.records_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        *self.dispatch.lock().await = Some((stop_tx, handle));
    }
}
