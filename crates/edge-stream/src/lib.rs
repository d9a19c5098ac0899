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

//! The streaming RPC client (C6, §4.6): one long-lived handle per
//! destination, guarded by a circuit breaker and retried with jittered
//! exponential backoff. Grounded on `ZeroBusClient`/`CircuitBreaker` in the
//! original implementation: the retry loop, the non-retriable/retriable
//! error split, and the metrics counters all mirror that class; the actual
//! wire transport sits behind `BatchTransport` since the upstream RPC
//! protocol is vendor-specific (see `DESIGN.md`).

pub mod circuit;
pub mod token;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use circuit::{Admission, CircuitBreaker, CircuitBreakerConfig};
use edge_batch::BatchSink;
use edge_credentials::CredentialStore;
use edge_model::{Batch, CircuitBreakerState, Destination};
use rand::Rng;
use tokio::sync::RwLock;
use token::{StreamCredentials, Token, TokenProvider};
use tracing::{debug, error, warn};

/// Errors raised while sending a batch.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    /// A transport, timeout, or server-side error worth retrying.
    #[error("retriable stream error: {reason}")]
    Retriable {
        /// The underlying reason.
        reason: String,
    },
    /// A schema or authorization error that will not succeed on retry.
    #[error("non-retriable stream error: {reason}")]
    NonRetriable {
        /// The underlying reason.
        reason: String,
    },
    /// The circuit breaker is open; the send was not attempted.
    #[error("circuit open for destination {destination_id}")]
    CircuitOpen {
        /// The destination whose circuit is open.
        destination_id: String,
    },
}

impl StreamError {
    /// Whether a retry is worth attempting.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StreamError::Retriable { .. })
    }
}

/// Backoff tunables for the per-batch retry loop (§4.6).
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied after each attempt.
    pub multiplier: f64,
    /// Ceiling on the delay.
    pub max_delay: Duration,
    /// Maximum attempts per batch, including the first, before giving up.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_delay.as_secs_f64() * config.multiplier.powi(attempt as i32);
    let capped = base.min(config.max_delay.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
}

/// Point-in-time metrics for one destination, mirroring the original
/// `ZeroBusClient.metrics` dict (§4.7 `get_metrics`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamMetrics {
    /// Total records successfully sent.
    pub records_sent: u64,
    /// Total batches successfully sent.
    pub batches_sent: u64,
    /// Total batches that exhausted retries and were dropped.
    pub failures: u64,
    /// Total retry attempts across all batches.
    pub retries: u64,
    /// Total times the circuit breaker tripped open.
    pub circuit_breaker_trips: u64,
}

#[derive(Default)]
struct Counters {
    records_sent: AtomicU64,
    batches_sent: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    circuit_breaker_trips: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> StreamMetrics {
        StreamMetrics {
            records_sent: self.records_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
        }
    }
}

/// The transport that actually puts bytes on the wire. Kept as a trait seam
/// so the circuit breaker, retry loop, and token refresh are testable
/// without a live endpoint.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Sends one batch to `destination`, authenticated with `token`.
    /// Returns an error classified as retriable or not.
    async fn send(&self, destination: &Destination, token: &Token, batch: &Batch) -> Result<(), StreamError>;
}

/// A `BatchTransport` that posts newline-delimited JSON records to the
/// destination's streaming RPC endpoint over HTTPS. Substitutes for a
/// vendor-specific streaming protocol (§9 Open Question).
pub struct HttpBatchTransport {
    http: reqwest::Client,
}

impl HttpBatchTransport {
    /// Creates a transport with a client-wide connect timeout (§5).
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for HttpBatchTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn send(&self, destination: &Destination, token: &Token, batch: &Batch) -> Result<(), StreamError> {
        let url = format!("https://{}/api/2.0/ingest/{}", destination.endpoint_host, destination.table_fqn);
        let rows: Vec<serde_json::Value> = batch
            .records
            .iter()
            .map(|record| {
                serde_json::json!({
                    "tag_path": record.tag.tag_path,
                    "tag_id": record.tag.tag_id,
                    "event_time_ms": record.tag.event_time_ms,
                    "value": format!("{}", record.tag.value),
                })
            })
            .collect();

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token.access_token)
            .json(&rows)
            .send()
            .await
            .map_err(|err| StreamError::Retriable { reason: err.to_string() })?;

        classify_response(response).await
    }
}

async fn classify_response(response: reqwest::Response) -> Result<(), StreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    let non_retriable_markers = ["invalid_argument", "failed_precondition", "schema", "permission_denied"];
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(StreamError::Retriable { reason: "unauthenticated, token will be refreshed".to_string() });
    }
    if status == reqwest::StatusCode::FORBIDDEN || non_retriable_markers.iter().any(|marker| body.contains(marker)) {
        return Err(StreamError::NonRetriable { reason: format!("{status}: {body}") });
    }
    Err(StreamError::Retriable { reason: format!("{status}: {body}") })
}

struct DestinationHandle {
    token: RwLock<Option<Token>>,
    breaker: CircuitBreaker,
    counters: Counters,
}

/// The stream client: one instance serves every destination, since each
/// destination is cheap (a token cache entry, a breaker, a counter set) and
/// sharing the transport and token provider avoids redundant connection pools.
pub struct StreamClient {
    transport: Arc<dyn BatchTransport>,
    token_provider: Arc<dyn TokenProvider>,
    credential_store: Arc<dyn CredentialStore>,
    retry: RetryConfig,
    destinations: RwLock<std::collections::HashMap<String, Arc<DestinationHandle>>>,
    breaker_config: CircuitBreakerConfig,
}

impl StreamClient {
    /// Creates a stream client with the given transport, token provider, and
    /// credential store.
    pub fn new(
        transport: Arc<dyn BatchTransport>,
        token_provider: Arc<dyn TokenProvider>,
        credential_store: Arc<dyn CredentialStore>,
        retry: RetryConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            transport,
            token_provider,
            credential_store,
            retry,
            destinations: RwLock::new(std::collections::HashMap::new()),
            breaker_config,
        }
    }

    async fn handle_for(&self, destination_id: &str) -> Arc<DestinationHandle> {
        if let Some(handle) = self.destinations.read().await.get(destination_id) {
            return handle.clone();
        }
        let mut guard = self.destinations.write().await;
        guard
            .entry(destination_id.to_string())
            .or_insert_with(|| {
                Arc::new(DestinationHandle {
                    token: RwLock::new(None),
                    breaker: CircuitBreaker::new(self.breaker_config),
                    counters: Counters::default(),
                })
            })
            .clone()
    }

    async fn resolve_token(&self, handle: &DestinationHandle, destination: &Destination, force_refresh: bool) -> Result<Token, StreamError> {
        {
            let cached = handle.token.read().await;
            if !force_refresh {
                if let Some(token) = cached.as_ref() {
                    if !token.is_expired(now_ms()) {
                        return Ok(token.clone());
                    }
                }
            }
        }

        let secret = self
            .credential_store
            .get(&destination.auth_ref)
            .await
            .map_err(|err| StreamError::NonRetriable { reason: format!("credential lookup failed: {err}") })?
            .ok_or_else(|| StreamError::NonRetriable { reason: format!("no credential for '{}'", destination.auth_ref) })?;

        let creds = StreamCredentials {
            token_url: format!("https://{}/oidc/v1/token", destination.workspace_host),
            client_id: destination.auth_ref.clone(),
            client_secret: secret,
        };

        let token = self.token_provider.token(&creds).await?;
        *handle.token.write().await = Some(token.clone());
        Ok(token)
    }

    /// Sends one batch to `destination`, retrying on retriable errors up to
    /// `retry.max_attempts` times with jittered exponential backoff. A single
    /// unauthorized response forces one token refresh before the error is
    /// otherwise treated as retriable, mirroring the original client's
    /// one-shot re-auth behavior.
    pub async fn send_batch(&self, destination: &Destination, batch: &Batch) -> Result<(), StreamError> {
        let handle = self.handle_for(&destination.destination_id).await;

        let admission = handle.breaker.admit();
        if admission == Admission::Rejected {
            handle.counters.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
            return Err(StreamError::CircuitOpen { destination_id: destination.destination_id.clone() });
        }

        let mut force_refresh = false;
        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            let token = match self.resolve_token(&handle, destination, force_refresh).await {
                Ok(token) => token,
                Err(err) => {
                    handle.breaker.record_failure();
                    return Err(err);
                }
            };
            force_refresh = false;

            match self.transport.send(destination, &token, batch).await {
                Ok(()) => {
                    handle.breaker.record_success();
                    handle.counters.records_sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    handle.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                    debug!(destination_id = %destination.destination_id, records = batch.len(), attempt, "batch sent");
                    return Ok(());
                }
                Err(StreamError::Retriable { reason }) if reason.contains("unauthenticated") => {
                    force_refresh = true;
                    last_error = Some(StreamError::Retriable { reason });
                }
                Err(err @ StreamError::NonRetriable { .. }) => {
                    handle.breaker.record_failure();
                    handle.counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(destination_id = %destination.destination_id, reason = %err, "batch dropped, non-retriable");
                    return Err(err);
                }
                Err(err) => {
                    last_error = Some(err);
                }
            }

            handle.counters.retries.fetch_add(1, Ordering::Relaxed);
            if attempt + 1 < self.retry.max_attempts {
                let delay = backoff_delay(&self.retry, attempt);
                warn!(destination_id = %destination.destination_id, attempt, delay_ms = delay.as_millis() as u64, "retrying batch send");
                tokio::time::sleep(delay).await;
            }
        }

        handle.breaker.record_failure();
        handle.counters.failures.fetch_add(1, Ordering::Relaxed);
        let err = last_error.unwrap_or_else(|| StreamError::Retriable { reason: "retries exhausted".to_string() });
        error!(destination_id = %destination.destination_id, reason = %err, "batch dropped, retries exhausted");
        Err(err)
    }

    /// Point-in-time metrics for one destination (§4.7).
    pub async fn metrics_for(&self, destination_id: &str) -> StreamMetrics {
        self.handle_for(destination_id).await.counters.snapshot()
    }

    /// The destination's circuit breaker state, for diagnostics (§4.7).
    pub async fn circuit_state(&self, destination_id: &str) -> CircuitBreakerState {
        self.handle_for(destination_id).await.breaker.snapshot()
    }
}

#[async_trait]
impl BatchSink for StreamClient {
    async fn submit(&self, destination_id: &str, batch: Batch) {
        // The batcher hands us only a destination id; the bridge is
        // responsible for registering the matching `Destination` before any
        // records are routed there (§4.7 wiring). Looking it up here would
        // require a second collaborator, so this adapter is intentionally
        // thin: `edge-bridge` calls `send_batch` directly with the resolved
        // `Destination`, and this impl exists to satisfy tests and any
        // destination addressed purely by id with no further metadata.
        let destination = Destination {
            destination_id: destination_id.to_string(),
            workspace_host: String::new(),
            endpoint_host: String::new(),
            table_fqn: String::new(),
            auth_ref: String::new(),
        };
        if let Err(err) = self.send_batch(&destination, &batch).await {
            error!(%destination_id, reason = %err, "submit via BatchSink failed");
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use edge_credentials::EnvCredentialStore;
    use edge_model::{DataType, NormalizedTag, Protocol, QueueRecord, Quality, RawValue};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    struct FailNTimesTransport {
        remaining_failures: AtomicUsize,
        retriable: bool,
    }

    #[async_trait]
    impl BatchTransport for FailNTimesTransport {
        async fn send(&self, _destination: &Destination, _token: &Token, _batch: &Batch) -> Result<(), StreamError> {
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(());
            }
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            if self.retriable {
                Err(StreamError::Retriable { reason: "simulated".to_string() })
            } else {
                Err(StreamError::NonRetriable { reason: "simulated schema error".to_string() })
            }
        }
    }

    struct FakeTokenProvider;

    #[async_trait]
    impl TokenProvider for FakeTokenProvider {
        async fn token(&self, _creds: &StreamCredentials) -> Result<Token, StreamError> {
            Ok(Token { access_token: "fake".to_string(), expires_at_ms: now_ms() + 3_600_000 })
        }
    }

    fn destination() -> Destination {
        Destination {
            destination_id: "ws.cat.schema.table".to_string(),
            workspace_host: "workspace.example.com".to_string(),
            endpoint_host: "ingest.example.com".to_string(),
            table_fqn: "cat.schema.table".to_string(),
            auth_ref: "creds-key".to_string(),
        }
    }

    fn batch() -> Batch {
        Batch {
            records: vec![QueueRecord {
                tag: NormalizedTag {
                    tag_path: "s/a/l/e/signal".into(),
                    tag_id: 1,
                    data_type: DataType::Float,
                    quality: Quality::Good,
                    value: RawValue::Float(1.0),
                    event_time_ms: 0,
                    source_name: "src".into(),
                    protocol: Protocol::Mqtt,
                    metadata: BTreeMap::new(),
                },
                ingest_time_ms: 0,
            }],
        }
    }

    async fn client_with(transport: FailNTimesTransport, retry: RetryConfig) -> StreamClient {
        let store = Arc::new(EnvCredentialStore::new());
        store.set("creds-key", "shh").await.unwrap();
        StreamClient::new(Arc::new(transport), Arc::new(FakeTokenProvider), store, retry, CircuitBreakerConfig::default())
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let client = client_with(
            FailNTimesTransport { remaining_failures: AtomicUsize::new(2), retriable: true },
            RetryConfig { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), multiplier: 1.5, max_attempts: 5 },
        )
        .await;

        let result = client.send_batch(&destination(), &batch()).await;
        assert!(result.is_ok());
        let metrics = client.metrics_for(&destination().destination_id).await;
        assert_eq!(metrics.batches_sent, 1);
        assert_eq!(metrics.retries, 2);
    }

    #[tokio::test]
    async fn non_retriable_error_is_not_retried() {
        let client = client_with(
            FailNTimesTransport { remaining_failures: AtomicUsize::new(10), retriable: false },
            RetryConfig::default(),
        )
        .await;

        let result = client.send_batch(&destination(), &batch()).await;
        assert!(matches!(result, Err(StreamError::NonRetriable { .. })));
        let metrics = client.metrics_for(&destination().destination_id).await;
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.retries, 0);
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures_and_rejects_further_sends() {
        let client = client_with(
            FailNTimesTransport { remaining_failures: AtomicUsize::new(100), retriable: true },
            RetryConfig { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(1), multiplier: 1.0, max_attempts: 1 },
        )
        .await;

        for _ in 0..5 {
            let _ = client.send_batch(&destination(), &batch()).await;
        }

        let result = client.send_batch(&destination(), &batch()).await;
        assert!(matches!(result, Err(StreamError::CircuitOpen { .. })));
    }
}
