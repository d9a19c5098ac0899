//! The OPC-UA protocol variant (§4.1, §6): walks the server's address space
//! from the `Objects` root (depth- and count-limited), then either polls all
//! discovered variables on a fixed cadence or subscribes to their data-change
//! notifications.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use edge_model::{Protocol, RawRecord, RawValue};
use opcua::client::prelude::*;
use opcua::types::{DataValue, NodeId, StatusCode};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::{Error, OnRecord, ProtocolClient, TestResult};

/// OPC-UA security policy (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPolicy {
    /// No message security.
    #[default]
    None,
    /// AES-256/SHA-256/P-256 suite.
    Basic256Sha256,
}

/// OPC-UA message security mode (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// No signing or encryption.
    #[default]
    None,
    /// Messages are signed but not encrypted.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

/// Optional client certificate/key and username/password credentials.
#[derive(Debug, Clone, Default)]
pub struct OpcUaCredentials {
    /// Path to a client certificate (DER or PEM), if certificate auth is used.
    pub client_cert_path: Option<String>,
    /// Path to the matching private key.
    pub private_key_path: Option<String>,
    /// Username, if username/password auth is used.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
}

/// How the client observes variable values once discovered (§4.1).
#[derive(Debug, Clone)]
pub enum AcquisitionMode {
    /// Read all cached variables every `interval` in fixed-size concurrent
    /// batches of `batch_size`. The default mode.
    Polling {
        /// Cadence between full read cycles.
        interval: Duration,
        /// Concurrent reads per cycle (default 25, §4.1).
        batch_size: usize,
    },
    /// A single server-side subscription with sampling interval 0 (all
    /// changes) per monitored item.
    Subscription {
        /// The subscription's publishing interval.
        publishing_interval: Duration,
    },
}

impl Default for AcquisitionMode {
    fn default() -> Self {
        AcquisitionMode::Polling {
            interval: Duration::from_millis(500),
            batch_size: 25,
        }
    }
}

/// Configuration for one OPC-UA source.
#[derive(Debug, Clone)]
pub struct OpcUaConfig {
    /// `opc.tcp://host:port[/path]`.
    pub endpoint: String,
    /// Security policy.
    pub security_policy: SecurityPolicy,
    /// Security mode.
    pub security_mode: SecurityMode,
    /// Optional certificate/username credentials.
    pub credentials: OpcUaCredentials,
    /// Whether to skip server certificate validation (development only).
    pub trust_server_cert: bool,
    /// How many variables to discover under `Objects` (default 500, §4.1).
    pub variable_limit: usize,
    /// Maximum browse depth from `Objects`.
    pub depth_limit: usize,
    /// Polling vs. subscription acquisition.
    pub mode: AcquisitionMode,
    /// Connect timeout (default 5 s, §5).
    pub connect_timeout: Duration,
}

impl Default for OpcUaConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            security_policy: SecurityPolicy::default(),
            security_mode: SecurityMode::default(),
            credentials: OpcUaCredentials::default(),
            trust_server_cert: false,
            variable_limit: 500,
            depth_limit: 8,
            mode: AcquisitionMode::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One variable discovered during the address-space walk.
#[derive(Debug, Clone)]
struct DiscoveredVariable {
    node_id: NodeId,
    tag_name: String,
}

/// The OPC-UA `ProtocolClient`.
pub struct OpcUaClient {
    source_name: String,
    config: OpcUaConfig,
    session: Option<Arc<AsyncMutex<Session>>>,
    variables: Vec<DiscoveredVariable>,
    unreadable_count: u64,
}

impl OpcUaClient {
    /// Creates a client for `source_name` bound to `config`.
    pub fn new(source_name: impl Into<String>, config: OpcUaConfig) -> Self {
        Self {
            source_name: source_name.into(),
            config,
            session: None,
            variables: Vec::new(),
            unreadable_count: 0,
        }
    }

    fn client_builder(&self) -> ClientBuilder {
        let mut builder = ClientBuilder::new()
            .application_name("edge-connector")
            .application_uri("urn:edge-connector")
            .session_retry_limit(0)
            .trust_server_certs(self.config.trust_server_cert);

        if let (Some(cert), Some(key)) = (&self.config.credentials.client_cert_path, &self.config.credentials.private_key_path) {
            builder = builder.certificate_path(cert).private_key_path(key);
        }
        builder
    }

    fn identity_token(&self) -> IdentityToken {
        match (&self.config.credentials.username, &self.config.credentials.password) {
            (Some(user), Some(pass)) => IdentityToken::UserName(user.clone(), pass.clone()),
            _ => IdentityToken::Anonymous,
        }
    }

    fn message_security_mode(&self) -> MessageSecurityMode {
        match self.config.security_mode {
            SecurityMode::None => MessageSecurityMode::None,
            SecurityMode::Sign => MessageSecurityMode::Sign,
            SecurityMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
        }
    }

    fn security_policy_uri(&self) -> &'static str {
        match self.config.security_policy {
            SecurityPolicy::None => SecurityPolicy_::None.to_uri(),
            SecurityPolicy::Basic256Sha256 => SecurityPolicy_::Basic256Sha256.to_uri(),
        }
    }

    /// Walks the address space from `Objects`, depth- and count-limited,
    /// caching `(node, node_id, tag_name)` triples for polling or subscribing.
    async fn discover_variables(&mut self, session: &Arc<AsyncMutex<Session>>) -> Result<(), Error> {
        let guard = session.lock().await;
        let mut frontier = vec![(ObjectId::ObjectsFolder.into(), 0usize)];
        let mut discovered = Vec::new();

        while let Some((node_id, depth)) = frontier.pop() {
            if discovered.len() >= self.config.variable_limit || depth > self.config.depth_limit {
                continue;
            }
            let children = match guard.browse(&node_id) {
                Ok(refs) => refs,
                Err(status) => {
                    warn!(source = %self.source_name, %status, "browse failed, skipping subtree");
                    continue;
                }
            };
            for reference in children {
                let child_id: NodeId = reference.node_id.node_id.clone();
                if reference.node_class == NodeClass::Variable {
                    discovered.push(DiscoveredVariable {
                        node_id: child_id,
                        tag_name: reference.browse_name.name.to_string(),
                    });
                    if discovered.len() >= self.config.variable_limit {
                        break;
                    }
                } else {
                    frontier.push((child_id, depth + 1));
                }
            }
        }

        debug!(source = %self.source_name, count = discovered.len(), "address space walk complete");
        self.variables = discovered;
        Ok(())
    }

    async fn poll_once(&mut self, session: &Arc<AsyncMutex<Session>>, batch_size: usize, on_record: &(dyn OnRecord)) {
        for chunk in self.variables.clone().chunks(batch_size.max(1)) {
            let reads: Vec<ReadValueId> = chunk.iter().map(|v| v.node_id.clone().into()).collect();
            let values = {
                let guard = session.lock().await;
                guard.read(&reads, TimestampsToReturn::Both, 0.0).await
            };
            match values {
                Ok(values) => {
                    for (variable, value) in chunk.iter().zip(values.into_iter()) {
                        if let Some(record) = self.data_value_to_record(variable, &value) {
                            on_record(record);
                        } else {
                            self.unreadable_count += 1;
                        }
                    }
                }
                Err(status) => {
                    warn!(source = %self.source_name, %status, "batch read failed");
                    self.unreadable_count += chunk.len() as u64;
                }
            }
        }
    }

    fn data_value_to_record(&self, variable: &DiscoveredVariable, value: &DataValue) -> Option<RawRecord> {
        let variant = value.value.as_ref()?;
        let status = value.status.unwrap_or(StatusCode::Good);
        Some(RawRecord {
            event_time_ms: now_ms(),
            source_name: self.source_name.clone(),
            endpoint: self.config.endpoint.clone(),
            protocol: Protocol::OpcUa,
            topic_or_path: variable.tag_name.clone(),
            value: variant_to_value(variant),
            metadata: BTreeMap::new(),
            status_code: status.bits() as i64,
            status_text: format!("{status}"),
        })
    }
}

#[async_trait]
impl ProtocolClient for OpcUaClient {
    async fn connect(&mut self) -> Result<(), Error> {
        let endpoint = self.config.endpoint.clone();
        let mut client = self.client_builder().client().ok_or_else(|| Error::Fatal {
            source_name: self.source_name.clone(),
            reason: "failed to build opc-ua client".to_string(),
        })?;

        let identity = self.identity_token();
        let security_policy = self.security_policy_uri();
        let security_mode = self.message_security_mode();

        let session = tokio::time::timeout(
            self.config.connect_timeout,
            client.connect_to_endpoint((endpoint.as_ref(), security_policy, security_mode, UserTokenPolicy::anonymous()), identity),
        )
        .await
        .map_err(|_| Error::Transient {
            source_name: self.source_name.clone(),
            reason: "connect timed out".to_string(),
        })?
        .map_err(|status| Error::Transient {
            source_name: self.source_name.clone(),
            reason: status.to_string(),
        })?;

        self.discover_variables(&session).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn subscribe_or_poll(&mut self, on_record: &(dyn OnRecord)) -> Result<(), Error> {
        let session = self.session.clone().ok_or_else(|| Error::Transient {
            source_name: self.source_name.clone(),
            reason: "not connected".to_string(),
        })?;

        match self.config.mode.clone() {
            AcquisitionMode::Polling { interval, batch_size } => loop {
                self.poll_once(&session, batch_size, on_record).await;
                tokio::time::sleep(interval).await;
            },
            AcquisitionMode::Subscription { publishing_interval } => {
                let subscription_id = {
                    let guard = session.lock().await;
                    guard
                        .create_subscription(publishing_interval, 10, 30, 0, 0, true, DataChangeCallback::new(move |_items| {}))
                        .await
                        .map_err(|status| Error::Transient {
                            source_name: self.source_name.clone(),
                            reason: status.to_string(),
                        })?
                };

                let items: Vec<MonitoredItemCreateRequest> = self
                    .variables
                    .iter()
                    .map(|v| MonitoredItemCreateRequest::new(v.node_id.clone().into(), MonitoringMode::Reporting, MonitoringParameters {
                        sampling_interval: 0.0,
                        ..Default::default()
                    }))
                    .collect();

                {
                    let guard = session.lock().await;
                    let _ = guard
                        .create_monitored_items(subscription_id, TimestampsToReturn::Both, items)
                        .await
                        .map_err(|status| Error::Transient {
                            source_name: self.source_name.clone(),
                            reason: status.to_string(),
                        })?;
                }

                // The callback registered above fires on the session's own
                // polling task; this loop just keeps the connection alive
                // until cancelled or the session reports a fatal error.
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let guard = session.lock().await;
                    if !guard.is_connected() {
                        return Err(Error::Transient {
                            source_name: self.source_name.clone(),
                            reason: "subscription session disconnected".to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let mut guard = session.lock().await;
            if let Err(err) = guard.disconnect().await {
                warn!(source = %self.source_name, reason = %err, "error disconnecting opc-ua session");
            }
        }
    }

    async fn test(&mut self) -> TestResult {
        let started = std::time::Instant::now();
        match self.connect().await {
            Ok(()) => {
                let info = format!("{} variables discovered", self.variables.len());
                self.disconnect().await;
                TestResult {
                    ok: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    server_info: Some(info),
                    error: None,
                }
            }
            Err(err) => {
                error!(source = %self.source_name, reason = %err, "opc-ua test probe failed");
                TestResult {
                    ok: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    server_info: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

/// Quality mapping is applied later by the normalizer (§4.2); this only
/// carries the raw scalar shape through.
fn variant_to_value(variant: &Variant) -> RawValue {
    match variant {
        Variant::Boolean(b) => RawValue::Bool(*b),
        Variant::SByte(v) => RawValue::Int(*v as i64),
        Variant::Byte(v) => RawValue::Int(*v as i64),
        Variant::Int16(v) => RawValue::Int(*v as i64),
        Variant::UInt16(v) => RawValue::Int(*v as i64),
        Variant::Int32(v) => RawValue::Int(*v as i64),
        Variant::UInt32(v) => RawValue::Int(*v as i64),
        Variant::Int64(v) => RawValue::Int(*v),
        Variant::UInt64(v) => RawValue::Int(*v as i64),
        Variant::Float(v) => RawValue::Float(*v as f64),
        Variant::Double(v) => RawValue::Float(*v),
        Variant::String(s) => RawValue::Str(s.to_string()),
        other => RawValue::Str(format!("{other:?}")),
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn variant_conversion_preserves_numeric_shape() {
        assert_eq!(variant_to_value(&Variant::Double(12.5)), RawValue::Float(12.5));
        assert_eq!(variant_to_value(&Variant::Int32(7)), RawValue::Int(7));
        assert_eq!(variant_to_value(&Variant::Boolean(true)), RawValue::Bool(true));
    }

    #[test]
    fn default_mode_is_polling_with_25_item_batches() {
        match OpcUaConfig::default().mode {
            AcquisitionMode::Polling { batch_size, .. } => assert_eq!(batch_size, 25),
            AcquisitionMode::Subscription { .. } => panic!("default should be polling"),
        }
    }
}
