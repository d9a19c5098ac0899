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

//! Data model shared across the ingest pipeline: the raw record produced by a
//! protocol client, the normalized tag produced by the normalizer, the queued
//! record owned by the backpressure queue, and the configuration entities
//! (`Source`, `Destination`) and runtime state (`CircuitBreakerState`) that
//! the bridge and stream client operate on.

use std::collections::BTreeMap;
use std::fmt;

pub mod spool;

/// The OT protocol a source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// OPC Unified Architecture.
    OpcUa,
    /// MQTT publish/subscribe.
    Mqtt,
    /// Modbus over TCP.
    ModbusTcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::OpcUa => "opcua",
            Protocol::Mqtt => "mqtt",
            Protocol::ModbusTcp => "modbus",
        };
        f.write_str(s)
    }
}

/// A scalar value as produced by a protocol client, before normalization.
///
/// `original_source`'s `ProtocolRecord.value` is an untyped `Any`; every
/// concrete protocol client (OPC-UA variant reads, MQTT payload decoding,
/// Modbus register reads) only ever produces one of these four shapes, so the
/// Rust model closes the enum instead of carrying a dynamic value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum RawValue {
    /// A boolean reading.
    Bool(bool),
    /// An integer reading.
    Int(i64),
    /// A floating point reading.
    Float(f64),
    /// A string reading (includes ISO-8601 timestamps before normalization).
    Str(String),
}

impl RawValue {
    /// Returns the value coerced to `f64` when it is numeric, as used to
    /// populate `RawRecord::value_num`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Bool(_) | RawValue::Str(_) => None,
            RawValue::Int(v) => Some(*v as f64),
            RawValue::Float(v) => Some(*v),
        }
    }

    /// A human-readable type name, mirroring `ProtocolRecord.value_type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::Float(_) => "float",
            RawValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Bool(v) => write!(f, "{v}"),
            RawValue::Int(v) => write!(f, "{v}"),
            RawValue::Float(v) => write!(f, "{v}"),
            RawValue::Str(v) => f.write_str(v),
        }
    }
}

/// A record emitted by a protocol client (C1) on each notification or poll
/// read. Consumed exactly once by the normalizer callback; never retained.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Event timestamp, milliseconds since the Unix epoch.
    pub event_time_ms: i64,
    /// The name of the source that produced this record (unique process-wide).
    pub source_name: String,
    /// The endpoint the source connects to (e.g. `opc.tcp://host:4840`).
    pub endpoint: String,
    /// The protocol the source speaks.
    pub protocol: Protocol,
    /// MQTT topic, OPC-UA browse path, or `register:<addr>` for Modbus.
    pub topic_or_path: String,
    /// The value read or received.
    pub value: RawValue,
    /// Protocol-specific metadata, scalar values only.
    pub metadata: BTreeMap<String, RawValue>,
    /// Raw status/quality code reported by the source protocol.
    pub status_code: i64,
    /// Human-readable status text.
    pub status_text: String,
}

impl RawRecord {
    /// The `value_num` field used by downstream consumers that need a numeric
    /// projection of `value` regardless of its declared type.
    pub fn value_num(&self) -> Option<f64> {
        self.value.as_f64()
    }
}

/// Data type inferred by the normalizer for a `NormalizedTag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Floating point.
    Float,
    /// Integer.
    Int,
    /// Boolean.
    Bool,
    /// String.
    String,
    /// ISO-8601 timestamp, stored as milliseconds since the epoch.
    Timestamp,
}

/// Tri-valued data health used throughout industrial telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// The reading is trustworthy.
    Good,
    /// The reading is not trustworthy.
    Bad,
    /// The reading may not be trustworthy (e.g. stale, or mid-transition).
    Uncertain,
}

/// A tag normalized to the unified ISA-95-ish schema. Output of the
/// normalizer (C2).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NormalizedTag {
    /// `site/area/line/equipment/signal`, always '/'-separated and lowercase.
    pub tag_path: String,
    /// A stable hash of `tag_path`. Deterministic across restarts.
    pub tag_id: u64,
    /// The inferred data type.
    pub data_type: DataType,
    /// The mapped quality.
    pub quality: Quality,
    /// The value, unchanged from the raw record.
    pub value: RawValue,
    /// Event timestamp, milliseconds since the Unix epoch.
    pub event_time_ms: i64,
    /// The name of the source that produced this tag.
    pub source_name: String,
    /// The protocol the source speaks.
    pub protocol: Protocol,
    /// Metadata carried over from the raw record.
    pub metadata: BTreeMap<String, RawValue>,
}

/// A `NormalizedTag` plus the timestamp at which the backpressure queue
/// accepted it. Owned exclusively by the queue from enqueue to dequeue.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QueueRecord {
    /// The normalized tag.
    pub tag: NormalizedTag,
    /// Milliseconds since the Unix epoch at the moment of enqueue.
    pub ingest_time_ms: i64,
}

/// Configuration entity for one remote columnar table. Two destinations with
/// the same `destination_id` share a single stream client instance.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Destination {
    /// `workspace_id.catalog.schema.table`, derived from the other fields.
    pub destination_id: String,
    /// The Databricks-style workspace host.
    pub workspace_host: String,
    /// The streaming RPC endpoint host (`host:443`).
    pub endpoint_host: String,
    /// `catalog.schema.table`.
    pub table_fqn: String,
    /// The credential store key used to authenticate the stream.
    pub auth_ref: String,
}

impl Destination {
    /// Derives the canonical `destination_id` from a workspace id and the
    /// table's fully-qualified name.
    pub fn derive_id(workspace_id: &str, table_fqn: &str) -> String {
        format!("{workspace_id}.{table_fqn}")
    }
}

/// Configuration entity for one protocol source.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Source {
    /// Unique process-wide, path-safe (letters, digits, `-`, `_`, `.`).
    pub source_name: String,
    /// The protocol this source speaks.
    pub protocol: Protocol,
    /// The endpoint to connect to.
    pub endpoint: String,
    /// Whether this source should be started.
    pub enabled: bool,
    /// Optional destination override; falls back to the global default.
    pub routing_hint: Option<String>,
}

/// Returns whether a source name is process-wide path-safe, per §3.
pub fn is_path_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// An ordered sequence of `QueueRecord`s destined for one `Destination`,
/// bounded by `max_records` or `max_age_ms`, whichever comes first.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// The records in enqueue order.
    pub records: Vec<QueueRecord>,
}

impl Batch {
    /// Number of records currently buffered.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The ingest time of the oldest record, used to evaluate `max_age_ms`.
    pub fn oldest_ingest_time_ms(&self) -> Option<i64> {
        self.records.first().map(|r| r.ingest_time_ms)
    }
}

/// The state of a per-destination circuit breaker (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Sends are attempted normally.
    Closed,
    /// Sends are rejected without attempting I/O.
    Open,
    /// A bounded number of probe sends are permitted.
    HalfOpen,
}

/// Full state of a destination's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive send failures observed in `Closed` or `HalfOpen`.
    pub consecutive_failures: u32,
    /// Milliseconds since the epoch at which the circuit opened, if open.
    pub opened_at_ms: Option<i64>,
    /// Probes currently in flight while `HalfOpen`.
    pub half_open_probes_in_flight: u32,
    /// Consecutive probe successes observed while `HalfOpen`.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at_ms: None,
            half_open_probes_in_flight: 0,
            half_open_successes: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_safe_name() {
        assert!(is_path_safe_name("line-1.press_A"));
        assert!(!is_path_safe_name("line 1"));
        assert!(!is_path_safe_name(""));
        assert!(!is_path_safe_name("line/1"));
    }

    #[test]
    fn destination_id_derivation() {
        assert_eq!(
            Destination::derive_id("ws123", "catalog.schema.table"),
            "ws123.catalog.schema.table"
        );
    }

    #[test]
    fn raw_value_numeric_projection() {
        assert_eq!(RawValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(RawValue::Float(3.5).as_f64(), Some(3.5));
        assert_eq!(RawValue::Bool(true).as_f64(), None);
        assert_eq!(RawValue::Str("x".into()).as_f64(), None);
    }

    #[test]
    fn batch_oldest_ingest_time() {
        let mut batch = Batch::default();
        assert_eq!(batch.oldest_ingest_time_ms(), None);
        batch.records.push(QueueRecord {
            tag: sample_tag(),
            ingest_time_ms: 100,
        });
        batch.records.push(QueueRecord {
            tag: sample_tag(),
            ingest_time_ms: 200,
        });
        assert_eq!(batch.oldest_ingest_time_ms(), Some(100));
    }

    fn sample_tag() -> NormalizedTag {
        NormalizedTag {
            tag_path: "site/area/line/equip/signal".into(),
            tag_id: 0,
            data_type: DataType::Float,
            quality: Quality::Good,
            value: RawValue::Float(1.0),
            event_time_ms: 0,
            source_name: "s".into(),
            protocol: Protocol::Mqtt,
            metadata: BTreeMap::new(),
        }
    }
}
