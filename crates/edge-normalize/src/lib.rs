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

//! The `Normalizer` capability (§4.2, §9): one method, `normalize`, turning a
//! `RawRecord` into a `NormalizedTag`. Each protocol is oblivious to the
//! others; `normalize_or_fallback` is the only entry point the rest of the
//! pipeline calls, and it never drops a record — a panicking or failing
//! normalizer degrades to the raw fallback shape instead.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use edge_model::{DataType, NormalizedTag, Protocol, Quality, RawRecord, RawValue};
use tracing::warn;

/// Converts one `RawRecord` into one `NormalizedTag`, in-process and
/// synchronously with the emitting protocol client's callback.
pub trait Normalizer: Send + Sync {
    /// Produces the normalized tag for `raw`. Implementations should not
    /// panic; `normalize_or_fallback` degrades gracefully if they do, but the
    /// degraded record loses the structured tag path.
    fn normalize(&self, raw: &RawRecord) -> NormalizedTag;
}

/// Counts records that fell back to the raw shape because normalization
/// panicked. Shared across threads; a point-in-time read is a plain relaxed
/// load (§5: metrics counters must be safe for concurrent increment).
#[derive(Default)]
pub struct NormalizationErrorCounter(AtomicU64);

impl NormalizationErrorCounter {
    /// Creates a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        let _ = self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Calls `normalizer.normalize(raw)`, catching a panic and substituting the
/// raw fallback tag described in §4.2 instead of letting it propagate.
/// Normalization MUST NOT drop records.
pub fn normalize_or_fallback(
    normalizer: &dyn Normalizer,
    raw: &RawRecord,
    errors: &NormalizationErrorCounter,
) -> NormalizedTag {
    match catch_unwind(AssertUnwindSafe(|| normalizer.normalize(raw))) {
        Ok(tag) => tag,
        Err(_) => {
            warn!(source = %raw.source_name, topic = %raw.topic_or_path, "normalizer panicked, falling back to raw tag");
            errors.increment();
            raw_fallback_tag(raw)
        }
    }
}

/// The raw fallback shape from §4.2: `tag_path = raw/<source>/<topic_or_path>`,
/// `data_type = string`, `quality = good`.
fn raw_fallback_tag(raw: &RawRecord) -> NormalizedTag {
    NormalizedTag {
        tag_path: format!("raw/{}/{}", raw.source_name, raw.topic_or_path),
        tag_id: tag_id(&format!("raw/{}/{}", raw.source_name, raw.topic_or_path)),
        data_type: DataType::String,
        quality: Quality::Good,
        value: raw.value.clone(),
        event_time_ms: raw.event_time_ms,
        source_name: raw.source_name.clone(),
        protocol: raw.protocol,
        metadata: raw.metadata.clone(),
    }
}

/// A deterministic hash of `tag_path`. Equal paths yield equal ids across
/// restarts within the same build (§3 invariant); this is a property of
/// `DefaultHasher`'s fixed keys, not of any per-process seed.
pub fn tag_id(tag_path: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    tag_path.hash(&mut hasher);
    hasher.finish()
}

/// Canonicalizes a raw `topic_or_path` into the `signal` component of a
/// `tag_path`: lowercase, non-alphanumeric become `_`, repeats collapse,
/// leading/trailing `_` are stripped.
pub fn canonicalize_signal(topic_or_path: &str) -> String {
    let mut out = String::with_capacity(topic_or_path.len());
    let mut prev_underscore = false;
    for ch in topic_or_path.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            prev_underscore = false;
        } else if !prev_underscore {
            out.push('_');
            prev_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// `DataType` inference (§4.2): the value's own shape already disambiguates
/// bool/int/float; a string is promoted to `timestamp` only if it parses as
/// RFC 3339 / ISO-8601, else it stays `string`.
pub fn infer_data_type(value: &RawValue) -> DataType {
    match value {
        RawValue::Bool(_) => DataType::Bool,
        RawValue::Int(_) => DataType::Int,
        RawValue::Float(_) => DataType::Float,
        RawValue::Str(s) => {
            if looks_like_iso8601(s) {
                DataType::Timestamp
            } else {
                DataType::String
            }
        }
    }
}

fn looks_like_iso8601(s: &str) -> bool {
    // A cheap structural check rather than a full RFC 3339 parse: avoids
    // pulling a datetime crate into the hot normalization path for a
    // best-effort classification.
    let bytes = s.as_bytes();
    bytes.len() >= 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[8..10].iter().all(u8::is_ascii_digit)
}

/// Quality mapping (§4.2): total over every raw status, one enum value per
/// record. Each protocol has its own status encoding.
pub fn infer_quality(raw: &RawRecord) -> Quality {
    match raw.protocol {
        Protocol::OpcUa => opcua_quality(raw.status_code),
        Protocol::Mqtt => mqtt_quality(raw),
        Protocol::ModbusTcp => modbus_quality(raw.status_code, &raw.status_text),
    }
}

fn opcua_quality(status_code: i64) -> Quality {
    let code = status_code as u32;
    if code == 0 {
        Quality::Good
    } else if code & 0x8000_0000 != 0 {
        Quality::Bad
    } else if code & 0xFF00_0000 == 0x4000_0000 {
        Quality::Uncertain
    } else {
        Quality::Good
    }
}

fn mqtt_quality(raw: &RawRecord) -> Quality {
    let retained = matches!(raw.metadata.get("retained"), Some(RawValue::Bool(true)));
    let stale = matches!(raw.metadata.get("stale"), Some(RawValue::Bool(true)));
    if retained && stale {
        Quality::Uncertain
    } else {
        Quality::Good
    }
}

fn modbus_quality(status_code: i64, status_text: &str) -> Quality {
    if status_code != 0 || status_text.to_ascii_lowercase().contains("exception") {
        Quality::Bad
    } else {
        Quality::Good
    }
}

/// The default `Normalizer`: assembles `tag_path` from a source's configured
/// `{site, area, line, equipment}` plus a canonicalized `signal` derived from
/// `topic_or_path` (§4.2).
pub struct IsaPathNormalizer {
    site: String,
    area: String,
    line: String,
    equipment: String,
}

impl IsaPathNormalizer {
    /// Builds a normalizer that prefixes every tag path with the given
    /// ISA-95 components.
    pub fn new(site: impl Into<String>, area: impl Into<String>, line: impl Into<String>, equipment: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            area: area.into(),
            line: line.into(),
            equipment: equipment.into(),
        }
    }
}

impl Normalizer for IsaPathNormalizer {
    fn normalize(&self, raw: &RawRecord) -> NormalizedTag {
        let signal = canonicalize_signal(&raw.topic_or_path);
        let tag_path = format!("{}/{}/{}/{}/{}", self.site, self.area, self.line, self.equipment, signal);
        NormalizedTag {
            tag_id: tag_id(&tag_path),
            data_type: infer_data_type(&raw.value),
            quality: infer_quality(raw),
            value: raw.value.clone(),
            event_time_ms: raw.event_time_ms,
            source_name: raw.source_name.clone(),
            protocol: raw.protocol,
            metadata: raw.metadata.clone(),
            tag_path,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn raw(protocol: Protocol, status_code: i64, status_text: &str, value: RawValue) -> RawRecord {
        RawRecord {
            event_time_ms: 1_700_000_000_000,
            source_name: "line1".to_string(),
            endpoint: "opc.tcp://10.0.0.5:4840".to_string(),
            protocol,
            topic_or_path: "Tank Level  #1!!".to_string(),
            value,
            metadata: BTreeMap::new(),
            status_code,
            status_text: status_text.to_string(),
        }
    }

    #[test]
    fn tag_id_is_deterministic() {
        assert_eq!(tag_id("plant/area/line/eq/signal"), tag_id("plant/area/line/eq/signal"));
        assert_ne!(tag_id("a"), tag_id("b"));
    }

    #[test]
    fn canonicalize_signal_collapses_and_trims() {
        assert_eq!(canonicalize_signal("Tank Level  #1!!"), "tank_level_1");
        assert_eq!(canonicalize_signal("__leading"), "leading");
    }

    #[test]
    fn data_type_inference_by_shape() {
        assert_eq!(infer_data_type(&RawValue::Bool(true)), DataType::Bool);
        assert_eq!(infer_data_type(&RawValue::Int(7)), DataType::Int);
        assert_eq!(infer_data_type(&RawValue::Float(7.5)), DataType::Float);
        assert_eq!(infer_data_type(&RawValue::Str("hello".to_string())), DataType::String);
        assert_eq!(infer_data_type(&RawValue::Str("2024-01-05T10:00:00Z".to_string())), DataType::Timestamp);
    }

    #[test]
    fn opcua_quality_mapping() {
        assert_eq!(opcua_quality(0), Quality::Good);
        assert_eq!(opcua_quality(0x8000_0000u32 as i64), Quality::Bad);
        assert_eq!(opcua_quality(0x4010_0000), Quality::Uncertain);
    }

    #[test]
    fn modbus_quality_mapping() {
        assert_eq!(modbus_quality(0, "ok"), Quality::Good);
        assert_eq!(modbus_quality(0, "Illegal Data Exception"), Quality::Bad);
        assert_eq!(modbus_quality(2, "ok"), Quality::Bad);
    }

    #[test]
    fn isa_normalizer_builds_path_and_id() {
        let normalizer = IsaPathNormalizer::new("plant1", "area2", "line3", "eq4");
        let r = raw(Protocol::OpcUa, 0, "", RawValue::Float(12.5));
        let tag = normalizer.normalize(&r);
        assert_eq!(tag.tag_path, "plant1/area2/line3/eq4/tank_level_1");
        assert_eq!(tag.tag_id, tag_id("plant1/area2/line3/eq4/tank_level_1"));
        assert_eq!(tag.quality, Quality::Good);
    }

    struct PanickingNormalizer;
    impl Normalizer for PanickingNormalizer {
        fn normalize(&self, _raw: &RawRecord) -> NormalizedTag {
            panic!("boom")
        }
    }

    #[test]
    fn fallback_on_panic_never_drops_the_record() {
        let errors = NormalizationErrorCounter::new();
        let r = raw(Protocol::Mqtt, 0, "", RawValue::Str("x".to_string()));
        let tag = normalize_or_fallback(&PanickingNormalizer, &r, &errors);
        assert_eq!(tag.tag_path, "raw/line1/Tank Level  #1!!");
        assert_eq!(tag.data_type, DataType::String);
        assert_eq!(tag.quality, Quality::Good);
        assert_eq!(errors.get(), 1);
    }
}
