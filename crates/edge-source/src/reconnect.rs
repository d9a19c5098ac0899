//! The reconnect supervisor shared by every protocol variant (§4.1). Mirrors
//! `ProtocolClient.run_with_reconnect` from the Python original: connect,
//! subscribe/poll, on failure disconnect cleanly, back off, retry. Stop
//! requests are honored within one backoff step.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use edge_model::RawRecord;
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{Error, ProtocolClient};

/// Reconnect behavior for one source.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether reconnection is attempted at all; `false` makes the first
    /// failure terminal.
    pub enabled: bool,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplicative backoff factor applied per consecutive failure.
    pub backoff_multiplier: f64,
    /// Maximum consecutive reconnect attempts before giving up; `0` = unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

/// Point-in-time connection status, surfaced through `get_status()` (§7).
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    /// Whether the client is currently connected.
    pub connected: bool,
    /// Milliseconds since the epoch of the last successful connect.
    pub last_connect_time_ms: Option<i64>,
    /// Milliseconds since the epoch of the last disconnect.
    pub last_disconnect_time_ms: Option<i64>,
    /// Consecutive reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// The last error observed, if any.
    pub last_error: Option<String>,
}

/// Runs `client` under the reconnect supervisor until `stop` is signalled or
/// a fatal error terminates the source. Every value the client observes is
/// forwarded to `on_record`. If `status_tx` is given, the current
/// `ConnectionStatus` is published to it at every state transition, so a
/// caller (e.g. the bridge's `get_status()`) can observe live status rather
/// than only the final value returned on exit.
pub async fn run_with_reconnect(
    source_name: &str,
    client: &mut dyn ProtocolClient,
    config: &ReconnectConfig,
    mut stop: watch::Receiver<bool>,
    on_record: &(dyn Fn(RawRecord) + Send + Sync),
    status_tx: Option<&watch::Sender<ConnectionStatus>>,
) -> ConnectionStatus {
    let mut status = ConnectionStatus::default();
    let mut retriable = true;

    while !*stop.borrow() {
        match client.connect().await {
            Ok(()) => {
                status.connected = true;
                status.last_connect_time_ms = Some(now_ms());
                status.reconnect_attempts = 0;
                status.last_error = None;
                info!(%source_name, "connected");
                publish(status_tx, &status);

                match client.subscribe_or_poll(on_record).await {
                    Ok(()) => {
                        // subscribe_or_poll only returns Ok on an explicit stop.
                    }
                    Err(err) => retriable = handle_failure(source_name, &mut status, err),
                }
            }
            Err(err) => retriable = handle_failure(source_name, &mut status, err),
        }

        client.disconnect().await;
        status.connected = false;
        status.last_disconnect_time_ms = Some(now_ms());
        publish(status_tx, &status);

        if !retriable {
            break;
        }
        if !config.enabled {
            break;
        }
        if config.max_attempts > 0 && status.reconnect_attempts >= config.max_attempts {
            error!(%source_name, attempts = status.reconnect_attempts, "max reconnection attempts exceeded, giving up on this source");
            break;
        }

        let delay = backoff_delay(config, status.reconnect_attempts);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }

    status
}

fn publish(status_tx: Option<&watch::Sender<ConnectionStatus>>, status: &ConnectionStatus) {
    if let Some(tx) = status_tx {
        let _ = tx.send(status.clone());
    }
}

fn handle_failure(source_name: &str, status: &mut ConnectionStatus, err: Error) -> bool {
    status.reconnect_attempts += 1;
    status.last_error = Some(err.to_string());
    let retriable = err.is_retriable();
    match &err {
        Error::Transient { .. } => {
            warn!(%source_name, reason = %err, attempts = status.reconnect_attempts, "transient error, will retry");
        }
        Error::Fatal { .. } => {
            error!(%source_name, reason = %err, "fatal configuration error, not retrying");
        }
    }
    retriable
}

/// Exponential backoff with multiplicative factor and ±10% jitter, clamped
/// to `[initial_delay, max_delay]` (§4.1).
fn backoff_delay(config: &ReconnectConfig, consecutive_failures: u32) -> Duration {
    let base = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(consecutive_failures.saturating_sub(1) as i32);
    let clamped = base.min(config.max_delay.as_secs_f64()).max(config.initial_delay.as_secs_f64());
    let jitter_fraction = rand::thread_rng().gen_range(-0.1..=0.1);
    let jittered = (clamped * (1.0 + jitter_fraction)).max(0.0);
    Duration::from_secs_f64(jittered)
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_is_clamped_and_grows() {
        let config = ReconnectConfig::default();
        let first = backoff_delay(&config, 1);
        let third = backoff_delay(&config, 3);
        assert!(first.as_secs_f64() >= 0.9 && first.as_secs_f64() <= 1.1);
        assert!(third.as_secs_f64() > first.as_secs_f64());

        let many = backoff_delay(&config, 20);
        assert!(many.as_secs_f64() <= config.max_delay.as_secs_f64() * 1.1);
    }
}
