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

//! Configuration objects for the edge connector (§6). The top-level keys are
//! `sources`, `destinations`, `routing`, `backpressure`, `batch`, `retry`,
//! `circuit_breaker`, `normalization`, and `proxy`. Credential placeholders of
//! the form `${credential:<key>}` are resolved against a `CredentialStore` at
//! load time, before the document is deserialized into typed configuration.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use edge_credentials::CredentialStore;
use edge_model::Protocol;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;

/// Errors for the config module.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or parsed.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// At least 2 sources with the same name were found.
    #[error("duplicate source '{source}' found (config file '{file}')")]
    DuplicateSource {
        /// The path to the config file.
        file: String,
        /// The duplicated source name.
        source: String,
    },

    /// A source's name is not process-wide path-safe (§3).
    #[error("source '{source}' has a name that is not path-safe (config file '{file}')")]
    UnsafeSourceName {
        /// The path to the config file.
        file: String,
        /// The offending source name.
        source: String,
    },

    /// A source's `routing_hint` names a destination that does not exist.
    #[error("source '{source}' routes to unknown destination '{destination}' (config file '{file}')")]
    UnknownRoutingHint {
        /// The path to the config file.
        file: String,
        /// The source name.
        source: String,
        /// The destination id referenced.
        destination: String,
    },

    /// `routing.default_destination` names a destination that does not exist.
    #[error("default destination '{destination}' is not declared (config file '{file}')")]
    UnknownDefaultDestination {
        /// The path to the config file.
        file: String,
        /// The destination id referenced.
        destination: String,
    },

    /// A `${credential:<key>}` placeholder could not be resolved.
    #[error("credential placeholder '{key}' could not be resolved: {reason}")]
    UnresolvedCredential {
        /// The credential key referenced by the placeholder.
        key: String,
        /// Why resolution failed.
        reason: String,
    },
}

/// One configured protocol source (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique process-wide, path-safe source name.
    pub source_name: String,
    /// The protocol this source speaks.
    pub protocol: Protocol,
    /// The endpoint to connect to.
    #[serde(default)]
    pub endpoint: String,
    /// Whether this source should be started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional destination override.
    #[serde(default)]
    pub routing_hint: Option<String>,
    /// Free-form protocol-specific parameters (polling interval, security
    /// mode, topic patterns, register ranges, ...), validated by the
    /// concrete protocol client rather than by this crate.
    #[serde(default)]
    pub protocol_params: Value,
}

fn default_true() -> bool {
    true
}

/// One configured remote destination (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// The Databricks-style workspace id, combined with `table_fqn` to
    /// derive `destination_id`.
    pub workspace_id: String,
    /// The workspace host.
    pub workspace_host: String,
    /// The streaming RPC endpoint host.
    pub endpoint_host: String,
    /// `catalog.schema.table`.
    pub table_fqn: String,
    /// The credential store key used to authenticate the stream.
    pub auth_ref: String,
}

impl DestinationConfig {
    /// Converts this configuration entry into the runtime `edge_model::Destination`.
    pub fn to_destination(&self) -> edge_model::Destination {
        edge_model::Destination {
            destination_id: edge_model::Destination::derive_id(&self.workspace_id, &self.table_fqn),
            workspace_host: self.workspace_host.clone(),
            endpoint_host: self.endpoint_host.clone(),
            table_fqn: self.table_fqn.clone(),
            auth_ref: self.auth_ref.clone(),
        }
    }
}

/// `routing.*` (§4.4, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// The destination used when a source has no `routing_hint`.
    pub default_destination: Option<String>,
}

/// `backpressure.*` (§4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Maximum records held in the in-memory queue.
    #[serde(default = "default_max_in_memory")]
    pub max_in_memory: usize,
    /// Overflow policy once memory and (if enabled) spool are full.
    #[serde(default)]
    pub drop_policy: DropPolicy,
    /// Whether disk-spool overflow is enabled.
    #[serde(default)]
    pub spool_enabled: bool,
    /// The directory spool segments are written to.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
    /// Maximum total bytes the spool may occupy.
    #[serde(default = "default_spool_max_bytes")]
    pub spool_max_bytes: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_in_memory: default_max_in_memory(),
            drop_policy: DropPolicy::default(),
            spool_enabled: false,
            spool_dir: default_spool_dir(),
            spool_max_bytes: default_spool_max_bytes(),
        }
    }
}

fn default_max_in_memory() -> usize {
    10_000
}

fn default_spool_dir() -> String {
    "./spool".to_string()
}

fn default_spool_max_bytes() -> u64 {
    1024 * 1024 * 1024
}

/// Overflow policy once both memory and spool are at capacity (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest in-memory record to make room for the new one.
    #[default]
    DropOldest,
    /// Reject the new record, keeping the existing ones.
    DropNewest,
}

/// `batch.*` (§4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush once the buffer reaches this many records.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// Flush once the oldest buffered record is this old.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: i64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_age_ms: default_max_age_ms(),
        }
    }
}

fn default_max_records() -> usize {
    1000
}

fn default_max_age_ms() -> i64 {
    5000
}

/// `retry.*` (§4.6, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial backoff between attempts for the same batch.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Maximum backoff between attempts.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Backoff multiplicative factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Maximum attempts per batch across reconnects.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    5
}

/// `circuit_breaker.*` (§4.6, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
    /// Maximum concurrent probe sends while half-open.
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
    /// Consecutive probe successes required to close the circuit.
    #[serde(default = "default_half_open_required_successes")]
    pub half_open_required_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            half_open_max_probes: default_half_open_max_probes(),
            half_open_required_successes: default_half_open_required_successes(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_ms() -> i64 {
    60_000
}
fn default_half_open_max_probes() -> u32 {
    3
}
fn default_half_open_required_successes() -> u32 {
    3
}

/// `normalization.*` (§4.2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationConfig {
    /// Whether normalization is enabled (if disabled, every record falls back
    /// to the raw `NormalizedTag` shape described in §4.2).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default ISA-95 `site` component.
    #[serde(default = "default_isa95_component")]
    pub site: String,
    /// Default ISA-95 `area` component.
    #[serde(default = "default_isa95_component")]
    pub area: String,
    /// Default ISA-95 `line` component.
    #[serde(default = "default_isa95_component")]
    pub line: String,
    /// Default ISA-95 `equipment` component.
    #[serde(default = "default_isa95_component")]
    pub equipment: String,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            site: default_isa95_component(),
            area: default_isa95_component(),
            line: default_isa95_component(),
            equipment: default_isa95_component(),
        }
    }
}

fn default_isa95_component() -> String {
    "default".to_string()
}

/// `proxy.*` (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Explicit HTTP proxy URL.
    pub http: Option<String>,
    /// Explicit HTTPS proxy URL.
    pub https: Option<String>,
    /// Comma-separated no-proxy hosts.
    pub no_proxy: Option<String>,
    /// Whether to additionally consult `PROXY_HTTP`/`PROXY_HTTPS`/`PROXY_NO_PROXY`.
    #[serde(default)]
    pub use_env: bool,
}

impl ProxyConfig {
    /// Resolves the effective proxy settings, consulting the environment
    /// when `use_env` is set, per §6.
    pub fn effective(&self) -> (Option<String>, Option<String>, Option<String>) {
        let http = self
            .http
            .clone()
            .or_else(|| if self.use_env { std::env::var("PROXY_HTTP").ok() } else { None });
        let https = self
            .https
            .clone()
            .or_else(|| if self.use_env { std::env::var("PROXY_HTTPS").ok() } else { None });
        let no_proxy = self
            .no_proxy
            .clone()
            .or_else(|| if self.use_env { std::env::var("PROXY_NO_PROXY").ok() } else { None });
        (http, https, no_proxy)
    }
}

/// The fully resolved bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Configured sources, keyed by `source_name`.
    pub sources: HashMap<String, SourceConfig>,
    /// Configured destinations, keyed by `destination_id`.
    pub destinations: HashMap<String, DestinationConfig>,
    /// Routing defaults.
    pub routing: RoutingConfig,
    /// Backpressure queue settings.
    pub backpressure: BackpressureConfig,
    /// Batcher settings.
    pub batch: BatchConfig,
    /// Retry settings for the stream client.
    pub retry: RetryConfig,
    /// Circuit breaker settings for the stream client.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Normalizer settings.
    pub normalization: NormalizationConfig,
    /// Outbound proxy settings.
    pub proxy: ProxyConfig,
}

/// The raw, on-disk shape of the configuration document, before validation.
#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    sources: Vec<SourceConfig>,
    #[serde(default)]
    destinations: HashMap<String, DestinationConfig>,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default)]
    backpressure: BackpressureConfig,
    #[serde(default)]
    batch: BatchConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    normalization: NormalizationConfig,
    #[serde(default)]
    proxy: ProxyConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { default_destination: None }
    }
}

impl BridgeConfig {
    /// Loads and validates the configuration file at `path`, resolving any
    /// `${credential:<key>}` placeholders against `credential_store`.
    pub async fn load<P: AsRef<Path>>(
        path: P,
        credential_store: &dyn CredentialStore,
    ) -> Result<Self, Error> {
        let file_name = path.as_ref().display().to_string();
        debug!(file = %file_name, "loading bridge configuration");

        let file = File::open(path.as_ref()).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;
        let reader = BufReader::new(file);
        let mut value: Value = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;

        resolve_credential_placeholders(&mut value, credential_store).await?;

        let raw: RawDocument = serde_yaml::from_value(value).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;

        let mut sources = HashMap::with_capacity(raw.sources.len());
        for source in raw.sources {
            if !edge_model::is_path_safe_name(&source.source_name) {
                return Err(Error::UnsafeSourceName {
                    file: file_name.clone(),
                    source: source.source_name,
                });
            }
            if sources.insert(source.source_name.clone(), source).is_some() {
                let name = sources.keys().last().cloned().unwrap_or_default();
                return Err(Error::DuplicateSource {
                    file: file_name.clone(),
                    source: name,
                });
            }
        }

        let mut destinations = HashMap::with_capacity(raw.destinations.len());
        for (id, cfg) in raw.destinations {
            destinations.insert(id, cfg);
        }

        for source in sources.values() {
            if let Some(hint) = &source.routing_hint {
                if !destinations.contains_key(hint) {
                    return Err(Error::UnknownRoutingHint {
                        file: file_name.clone(),
                        source: source.source_name.clone(),
                        destination: hint.clone(),
                    });
                }
            }
        }

        if let Some(default_destination) = &raw.routing.default_destination {
            if !destinations.contains_key(default_destination) {
                return Err(Error::UnknownDefaultDestination {
                    file: file_name.clone(),
                    destination: default_destination.clone(),
                });
            }
        }

        debug!(file = %file_name, sources = sources.len(), destinations = destinations.len(), "configuration loaded");

        Ok(BridgeConfig {
            sources,
            destinations,
            routing: raw.routing,
            backpressure: raw.backpressure,
            batch: raw.batch,
            retry: raw.retry,
            circuit_breaker: raw.circuit_breaker,
            normalization: raw.normalization,
            proxy: raw.proxy,
        })
    }
}

/// Recursively walks a parsed YAML document, replacing any string scalar of
/// the form `${credential:<key>}` with the value looked up from
/// `credential_store`.
async fn resolve_credential_placeholders(value: &mut Value, store: &dyn CredentialStore) -> Result<(), Error> {
    match value {
        Value::String(s) => {
            if let Some(key) = placeholder_key(s) {
                let resolved = store
                    .get(key)
                    .await
                    .map_err(|e| Error::UnresolvedCredential {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?
                    .ok_or_else(|| Error::UnresolvedCredential {
                        key: key.to_string(),
                        reason: "no value in credential store".to_string(),
                    })?;
                *s = resolved;
            }
            Ok(())
        }
        Value::Sequence(items) => {
            for item in items {
                Box::pin(resolve_credential_placeholders(item, store)).await?;
            }
            Ok(())
        }
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                Box::pin(resolve_credential_placeholders(v, store)).await?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Extracts the `<key>` from a `${credential:<key>}` placeholder string.
fn placeholder_key(s: &str) -> Option<&str> {
    s.strip_prefix("${credential:").and_then(|rest| rest.strip_suffix('}'))
}

#[cfg(test)]
mod test {
    use super::*;
    use edge_credentials::EnvCredentialStore;
    use std::io::Write;

    fn sample_yaml() -> &'static str {
        r#"
sources:
  - source_name: line1-opcua
    protocol: opc_ua
    endpoint: "opc.tcp://10.0.0.5:4840"
    routing_hint: primary
destinations:
  primary:
    workspace_id: ws123
    workspace_host: adb-123.azuredatabricks.net
    endpoint_host: ingest.cloud.example:443
    table_fqn: catalog.schema.table
    auth_ref: "${credential:primary-auth}"
routing:
  default_destination: primary
backpressure:
  max_in_memory: 500
  drop_policy: drop_newest
"#
    }

    #[tokio::test]
    async fn loads_and_resolves_credential_placeholder() {
        let store = EnvCredentialStore::new();
        store.set("primary-auth", "secret-token").await.unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_yaml().as_bytes()).unwrap();

        let config = BridgeConfig::load(file.path(), &store).await.unwrap();
        assert_eq!(config.sources.len(), 1);
        let dest = &config.destinations["primary"];
        assert_eq!(dest.auth_ref, "secret-token");
        assert_eq!(config.backpressure.max_in_memory, 500);
        assert_eq!(config.backpressure.drop_policy, DropPolicy::DropNewest);
    }

    #[tokio::test]
    async fn unresolved_credential_is_an_error() {
        let store = EnvCredentialStore::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_yaml().as_bytes()).unwrap();

        let err = BridgeConfig::load(file.path(), &store).await.unwrap_err();
        assert!(matches!(err, Error::UnresolvedCredential { .. }));
    }

    #[tokio::test]
    async fn unknown_routing_hint_is_rejected() {
        let store = EnvCredentialStore::new();
        store.set("primary-auth", "secret-token").await.unwrap();
        let yaml = sample_yaml().replace("routing_hint: primary", "routing_hint: missing");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let err = BridgeConfig::load(file.path(), &store).await.unwrap_err();
        assert!(matches!(err, Error::UnknownRoutingHint { .. }));
    }

    #[test]
    fn placeholder_key_extraction() {
        assert_eq!(placeholder_key("${credential:foo}"), Some("foo"));
        assert_eq!(placeholder_key("plain-value"), None);
        assert_eq!(placeholder_key("${credential:}"), Some(""));
    }
}
