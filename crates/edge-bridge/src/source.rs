//! Builds the concrete `ProtocolClient` for one configured source and runs it
//! under the shared reconnect supervisor (§4.1, §4.7 `start()`).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use edge_config::SourceConfig;
use edge_model::{Protocol, QueueRecord, RawRecord};
use edge_normalize::{normalize_or_fallback, NormalizationErrorCounter, Normalizer};
use edge_queue::BackpressureQueue;
use edge_source::modbus::ModbusClient;
use edge_source::mqtt::MqttClient;
use edge_source::opcua::OpcUaClient;
use edge_source::reconnect::{run_with_reconnect, ConnectionStatus};
use edge_source::ProtocolClient;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::metrics::BridgeMetricsInner;
use crate::protocol_config;
use crate::Error;

/// A running source: its reconnect supervisor task plus the handles needed to
/// observe and stop it.
pub struct SourceEntry {
    /// The configuration this source was started with.
    pub config: SourceConfig,
    /// Signals the supervisor to stop.
    pub stop_tx: watch::Sender<bool>,
    /// Live connection status, updated at every supervisor state transition.
    pub status_rx: watch::Receiver<ConnectionStatus>,
    /// The supervisor task.
    pub handle: JoinHandle<ConnectionStatus>,
}

fn build_client(source: &SourceConfig) -> Result<Box<dyn ProtocolClient>, Error> {
    match source.protocol {
        Protocol::Mqtt => {
            let config = protocol_config::mqtt_config(&source.source_name, &source.endpoint, source.protocol_params.clone())?;
            Ok(Box::new(MqttClient::new(source.source_name.clone(), config)))
        }
        Protocol::ModbusTcp => {
            let config = protocol_config::modbus_config(&source.source_name, &source.endpoint, source.protocol_params.clone())?;
            Ok(Box::new(ModbusClient::new(source.source_name.clone(), config)))
        }
        Protocol::OpcUa => {
            let config = protocol_config::opcua_config(&source.source_name, &source.endpoint, source.protocol_params.clone())?;
            Ok(Box::new(OpcUaClient::new(source.source_name.clone(), config)))
        }
    }
}

/// Starts `source` under the reconnect supervisor. `on_enqueued` is called
/// with the outcome of each enqueue attempt so the caller can keep its
/// bridge-wide metrics (`records_enqueued`/`records_dropped`) up to date.
pub fn spawn(
    source: SourceConfig,
    queue: Arc<BackpressureQueue>,
    normalizer: Arc<dyn Normalizer>,
    normalization_errors: Arc<NormalizationErrorCounter>,
    metrics: Arc<BridgeMetricsInner>,
) -> Result<SourceEntry, Error> {
    let mut client = build_client(&source)?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
    let reconnect_config = protocol_config::reconnect_config(&source.protocol_params);
    let source_name = source.source_name.clone();
    let config_for_entry = source.clone();

    spawn_reconnection_counter(status_rx.clone(), metrics.clone());

    let on_record = move |raw: RawRecord| {
        metrics.records_received.fetch_add(1, Ordering::Relaxed);
        let tag = normalize_or_fallback(normalizer.as_ref(), &raw, &normalization_errors);
        metrics.records_normalized.fetch_add(1, Ordering::Relaxed);
        let record = QueueRecord { tag, ingest_time_ms: now_ms() };
        let outcome = queue.enqueue(record);
        if outcome.accepted {
            metrics.records_enqueued.fetch_add(1, Ordering::Relaxed);
        } else {
            metrics.records_dropped.fetch_add(1, Ordering::Relaxed);
        }
    };

    let handle = tokio::spawn(async move {
        run_with_reconnect(&source_name, client.as_mut(), &reconnect_config, stop_rx, &on_record, Some(&status_tx)).await
    });

    Ok(SourceEntry { config: config_for_entry, stop_tx, status_rx, handle })
}

/// Counts every successful connect after the first one as a reconnection
/// (§4.7/§8 `reconnections`). Exits once `status_tx` is dropped, which happens
/// when the supervisor task above returns.
fn spawn_reconnection_counter(mut status_rx: watch::Receiver<ConnectionStatus>, metrics: Arc<BridgeMetricsInner>) {
    let _: JoinHandle<()> = tokio::spawn(async move {
        let mut connected_once = false;
        while status_rx.changed().await.is_ok() {
            if status_rx.borrow().connected {
                if connected_once {
                    metrics.reconnections.fetch_add(1, Ordering::Relaxed);
                }
                connected_once = true;
            }
        }
    });
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
