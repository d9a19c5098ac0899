//! The MQTT protocol variant (§4.1, §6): subscribes to configured topic
//! patterns at configured QoS; each message becomes a `RawRecord` with
//! `topic_or_path = topic`.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use edge_model::{Protocol, RawRecord, RawValue};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, warn};

use crate::{Error, OnRecord, ProtocolClient, TestResult};

/// One topic pattern subscribed at a given QoS (`+`/`#` wildcards per §6).
#[derive(Debug, Clone)]
pub struct TopicSubscription {
    /// The topic filter, e.g. `plant/+/press/#`.
    pub filter: String,
    /// The QoS level (0, 1, or 2) requested for this filter.
    pub qos: u8,
}

/// Configuration for one MQTT source.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// `mqtt[s]://host:port`.
    pub endpoint: String,
    /// The topic filters to subscribe to.
    pub subscriptions: Vec<TopicSubscription>,
    /// Connect timeout (default 3 s, §5).
    pub connect_timeout: Duration,
    /// Client id presented to the broker.
    pub client_id: String,
    /// Optional username/password.
    pub credentials: Option<(String, String)>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            subscriptions: Vec::new(),
            connect_timeout: Duration::from_secs(3),
            client_id: "edge-connector".to_string(),
            credentials: None,
        }
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// The MQTT `ProtocolClient`. Connection is a broker TCP session managed by
/// `rumqttc`'s event loop; `subscribe_or_poll` drives that event loop until a
/// fatal error or disconnect, translating each publish into a `RawRecord`.
pub struct MqttClient {
    source_name: String,
    config: MqttConfig,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
}

impl MqttClient {
    /// Creates a client for `source_name` bound to `config`.
    pub fn new(source_name: impl Into<String>, config: MqttConfig) -> Self {
        Self {
            source_name: source_name.into(),
            config,
            client: None,
            event_loop: None,
        }
    }

    fn mqtt_options(&self) -> Result<MqttOptions, Error> {
        let url = self.config.endpoint.trim_start_matches("mqtt://").trim_start_matches("mqtts://");
        let (host, port) = url.split_once(':').ok_or_else(|| Error::Fatal {
            source_name: self.source_name.clone(),
            reason: format!("endpoint '{}' is not host:port", self.config.endpoint),
        })?;
        let port: u16 = port.parse().map_err(|_| Error::Fatal {
            source_name: self.source_name.clone(),
            reason: format!("invalid port in endpoint '{}'", self.config.endpoint),
        })?;

        let mut options = MqttOptions::new(self.config.client_id.clone(), host, port);
        let _ = options.set_keep_alive(Duration::from_secs(30));
        if let Some((user, pass)) = &self.config.credentials {
            let _ = options.set_credentials(user.clone(), pass.clone());
        }
        Ok(options)
    }
}

#[async_trait]
impl ProtocolClient for MqttClient {
    async fn connect(&mut self) -> Result<(), Error> {
        let options = self.mqtt_options()?;
        let (client, event_loop) = AsyncClient::new(options, 100);

        for sub in &self.config.subscriptions {
            client
                .subscribe(&sub.filter, qos_from_u8(sub.qos))
                .await
                .map_err(|err| Error::Transient {
                    source_name: self.source_name.clone(),
                    reason: format!("subscribe to '{}' failed: {err}", sub.filter),
                })?;
        }

        self.client = Some(client);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    async fn subscribe_or_poll(&mut self, on_record: &(dyn OnRecord)) -> Result<(), Error> {
        let event_loop = self.event_loop.as_mut().ok_or_else(|| Error::Transient {
            source_name: self.source_name.clone(),
            reason: "not connected".to_string(),
        })?;

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let record = publish_to_record(&self.source_name, &self.config.endpoint, &publish);
                    on_record(record);
                }
                Ok(_) => {}
                Err(err) => {
                    return Err(Error::Transient {
                        source_name: self.source_name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(err) = client.disconnect().await {
                warn!(source = %self.source_name, reason = %err, "error disconnecting mqtt client");
            }
        }
        self.event_loop = None;
    }

    async fn test(&mut self) -> TestResult {
        let started = std::time::Instant::now();
        match self.connect().await {
            Ok(()) => {
                self.disconnect().await;
                TestResult {
                    ok: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    server_info: Some(self.config.endpoint.clone()),
                    error: None,
                }
            }
            Err(err) => TestResult {
                ok: false,
                duration_ms: started.elapsed().as_millis() as u64,
                server_info: None,
                error: Some(err.to_string()),
            },
        }
    }
}

fn publish_to_record(source_name: &str, endpoint: &str, publish: &rumqttc::Publish) -> RawRecord {
    let payload = String::from_utf8_lossy(&publish.payload).to_string();
    let value = decode_payload(&payload);

    let mut metadata = BTreeMap::new();
    let _ = metadata.insert("retained".to_string(), RawValue::Bool(publish.retain));
    let _ = metadata.insert("qos".to_string(), RawValue::Int(publish.qos as i64));

    debug!(%source_name, topic = %publish.topic, "mqtt message received");

    RawRecord {
        event_time_ms: now_ms(),
        source_name: source_name.to_string(),
        endpoint: endpoint.to_string(),
        protocol: Protocol::Mqtt,
        topic_or_path: publish.topic.clone(),
        value,
        metadata,
        status_code: 0,
        status_text: String::new(),
    }
}

/// Decodes an MQTT payload into the closed `RawValue` shape: tries integer,
/// then float, then boolean literal, else keeps the raw string.
fn decode_payload(payload: &str) -> RawValue {
    let trimmed = payload.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        RawValue::Int(i)
    } else if let Ok(f) = trimmed.parse::<f64>() {
        RawValue::Float(f)
    } else if trimmed.eq_ignore_ascii_case("true") {
        RawValue::Bool(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        RawValue::Bool(false)
    } else {
        RawValue::Str(payload.to_string())
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_payload_prefers_numeric_then_bool_then_string() {
        assert_eq!(decode_payload("42"), RawValue::Int(42));
        assert_eq!(decode_payload("3.5"), RawValue::Float(3.5));
        assert_eq!(decode_payload("true"), RawValue::Bool(true));
        assert_eq!(decode_payload("FALSE"), RawValue::Bool(false));
        assert_eq!(decode_payload("running"), RawValue::Str("running".to_string()));
    }

    #[test]
    fn qos_mapping_covers_all_three_levels() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }
}
