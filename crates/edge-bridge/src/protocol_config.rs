//! Converts a source's free-form `protocol_params` YAML (§6) into the
//! concrete per-protocol config structs `edge_source` expects. Each `Raw*`
//! struct mirrors the `_ms`-suffixed-integer convention `edge_config` uses
//! for its own settings, then converts into the `Duration`-typed runtime
//! config once parsed.

use std::time::Duration;

use edge_source::modbus::{ModbusConfig, RegisterRange};
use edge_source::mqtt::{MqttConfig, TopicSubscription};
use edge_source::opcua::{AcquisitionMode, OpcUaConfig, OpcUaCredentials, SecurityMode, SecurityPolicy};
use edge_source::reconnect::ReconnectConfig;
use serde::Deserialize;
use serde_yaml::Value;

use crate::Error;

fn parse<'a, T: Deserialize<'a>>(source_name: &str, value: Value) -> Result<T, Error> {
    serde_yaml::from_value(value).map_err(|err| Error::InvalidProtocolParams {
        source_name: source_name.to_string(),
        reason: err.to_string(),
    })
}

/// Reconnect tunables, read from the same free-form `protocol_params` as the
/// protocol-specific settings since every source carries them regardless of
/// which protocol it speaks. `reconnect_max_attempts` defaults to 0
/// (unlimited), matching `ReconnectConfig::default()`'s "retried forever"
/// contract.
#[derive(Debug, Default, Deserialize)]
struct RawReconnectParams {
    #[serde(default)]
    reconnect_enabled: Option<bool>,
    #[serde(default)]
    reconnect_initial_delay_ms: Option<u64>,
    #[serde(default)]
    reconnect_max_delay_ms: Option<u64>,
    #[serde(default)]
    reconnect_backoff_multiplier: Option<f64>,
    #[serde(default)]
    reconnect_max_attempts: Option<u32>,
}

/// Builds the reconnect supervisor's configuration for one source,
/// overlaying whatever `reconnect_*` keys are present in `protocol_params`
/// onto `ReconnectConfig::default()`. Unlike the protocol-specific configs,
/// a parse failure here degrades to the default rather than erroring, since
/// these keys are optional overlays on an already-valid document.
pub fn reconnect_config(protocol_params: &Value) -> ReconnectConfig {
    let raw: RawReconnectParams = serde_yaml::from_value(protocol_params.clone()).unwrap_or_default();
    let default = ReconnectConfig::default();
    ReconnectConfig {
        enabled: raw.reconnect_enabled.unwrap_or(default.enabled),
        initial_delay: raw.reconnect_initial_delay_ms.map(Duration::from_millis).unwrap_or(default.initial_delay),
        max_delay: raw.reconnect_max_delay_ms.map(Duration::from_millis).unwrap_or(default.max_delay),
        backoff_multiplier: raw.reconnect_backoff_multiplier.unwrap_or(default.backoff_multiplier),
        max_attempts: raw.reconnect_max_attempts.unwrap_or(default.max_attempts),
    }
}

#[derive(Debug, Deserialize)]
struct RawMqttConfig {
    #[serde(default)]
    subscriptions: Vec<RawTopicSubscription>,
    #[serde(default = "default_mqtt_connect_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTopicSubscription {
    filter: String,
    #[serde(default)]
    qos: u8,
}

fn default_mqtt_connect_timeout_ms() -> u64 {
    3_000
}

fn default_client_id() -> String {
    "edge-connector".to_string()
}

/// Builds an `MqttConfig` from `endpoint` and `protocol_params`.
pub fn mqtt_config(source_name: &str, endpoint: &str, protocol_params: Value) -> Result<MqttConfig, Error> {
    let raw: RawMqttConfig = parse(source_name, protocol_params)?;
    Ok(MqttConfig {
        endpoint: endpoint.to_string(),
        subscriptions: raw
            .subscriptions
            .into_iter()
            .map(|s| TopicSubscription { filter: s.filter, qos: s.qos })
            .collect(),
        connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
        client_id: raw.client_id,
        credentials: match (raw.username, raw.password) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        },
    })
}

#[derive(Debug, Deserialize)]
struct RawModbusConfig {
    #[serde(default = "default_unit_id")]
    unit_id: u8,
    #[serde(default)]
    ranges: Vec<RawRegisterRange>,
    #[serde(default = "default_modbus_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_modbus_connect_timeout_ms")]
    connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RawRegisterRange {
    start: u16,
    count: u16,
}

fn default_unit_id() -> u8 {
    1
}

fn default_modbus_poll_interval_ms() -> u64 {
    1_000
}

fn default_modbus_connect_timeout_ms() -> u64 {
    2_000
}

/// Builds a `ModbusConfig` from `endpoint` and `protocol_params`.
pub fn modbus_config(source_name: &str, endpoint: &str, protocol_params: Value) -> Result<ModbusConfig, Error> {
    let raw: RawModbusConfig = parse(source_name, protocol_params)?;
    Ok(ModbusConfig {
        endpoint: endpoint.to_string(),
        unit_id: raw.unit_id,
        ranges: raw.ranges.into_iter().map(|r| RegisterRange { start: r.start, count: r.count }).collect(),
        poll_interval: Duration::from_millis(raw.poll_interval_ms),
        connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
    })
}

#[derive(Debug, Deserialize)]
struct RawOpcUaConfig {
    #[serde(default)]
    security_policy: RawSecurityPolicy,
    #[serde(default)]
    security_mode: RawSecurityMode,
    #[serde(default)]
    client_cert_path: Option<String>,
    #[serde(default)]
    private_key_path: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    trust_server_cert: bool,
    #[serde(default = "default_variable_limit")]
    variable_limit: usize,
    #[serde(default = "default_depth_limit")]
    depth_limit: usize,
    #[serde(default = "default_true")]
    polling_mode: bool,
    #[serde(default = "default_polling_interval_ms")]
    polling_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_publishing_interval_ms")]
    publishing_interval_ms: u64,
    #[serde(default = "default_opcua_connect_timeout_ms")]
    connect_timeout_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawSecurityPolicy {
    #[default]
    None,
    Basic256Sha256,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawSecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

fn default_variable_limit() -> usize {
    500
}

fn default_depth_limit() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_polling_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    25
}

fn default_publishing_interval_ms() -> u64 {
    1_000
}

fn default_opcua_connect_timeout_ms() -> u64 {
    5_000
}

/// Builds an `OpcUaConfig` from `endpoint` and `protocol_params`.
pub fn opcua_config(source_name: &str, endpoint: &str, protocol_params: Value) -> Result<OpcUaConfig, Error> {
    let raw: RawOpcUaConfig = parse(source_name, protocol_params)?;
    let mode = if raw.polling_mode {
        AcquisitionMode::Polling {
            interval: Duration::from_millis(raw.polling_interval_ms),
            batch_size: raw.batch_size,
        }
    } else {
        AcquisitionMode::Subscription {
            publishing_interval: Duration::from_millis(raw.publishing_interval_ms),
        }
    };

    Ok(OpcUaConfig {
        endpoint: endpoint.to_string(),
        security_policy: match raw.security_policy {
            RawSecurityPolicy::None => SecurityPolicy::None,
            RawSecurityPolicy::Basic256Sha256 => SecurityPolicy::Basic256Sha256,
        },
        security_mode: match raw.security_mode {
            RawSecurityMode::None => SecurityMode::None,
            RawSecurityMode::Sign => SecurityMode::Sign,
            RawSecurityMode::SignAndEncrypt => SecurityMode::SignAndEncrypt,
        },
        credentials: OpcUaCredentials {
            client_cert_path: raw.client_cert_path,
            private_key_path: raw.private_key_path,
            username: raw.username,
            password: raw.password,
        },
        trust_server_cert: raw.trust_server_cert,
        variable_limit: raw.variable_limit,
        depth_limit: raw.depth_limit,
        mode,
        connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mqtt_defaults_apply_when_params_are_empty() {
        let params: Value = serde_yaml::from_str("{}").unwrap();
        let config = mqtt_config("s", "mqtt://broker:1883", params).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.client_id, "edge-connector");
    }

    #[test]
    fn modbus_parses_register_ranges() {
        let params: Value = serde_yaml::from_str("ranges:\n  - start: 0\n    count: 10\n").unwrap();
        let config = modbus_config("s", "modbus://10.0.0.1:502", params).unwrap();
        assert_eq!(config.ranges.len(), 1);
        assert_eq!(config.ranges[0].count, 10);
    }

    #[test]
    fn opcua_defaults_to_polling_with_500ms_interval() {
        let params: Value = serde_yaml::from_str("{}").unwrap();
        let config = opcua_config("s", "opc.tcp://plc:4840", params).unwrap();
        match config.mode {
            AcquisitionMode::Polling { interval, batch_size } => {
                assert_eq!(interval, Duration::from_millis(500));
                assert_eq!(batch_size, 25);
            }
            AcquisitionMode::Subscription { .. } => panic!("expected polling by default"),
        }
    }

    #[test]
    fn reconnect_config_defaults_to_unlimited_attempts() {
        let params: Value = serde_yaml::from_str("{}").unwrap();
        let config = reconnect_config(&params);
        assert_eq!(config.max_attempts, 0);
        assert!(config.enabled);
    }

    #[test]
    fn reconnect_config_overlays_configured_max_attempts() {
        let params: Value = serde_yaml::from_str("reconnect_max_attempts: 10\nreconnect_initial_delay_ms: 250\n").unwrap();
        let config = reconnect_config(&params);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, ReconnectConfig::default().max_delay);
    }
}
