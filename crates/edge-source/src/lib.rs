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

//! The protocol client (C1, §4.1): one live connection per source, emitting
//! `RawRecord`s to the normalizer. All three protocol variants share the same
//! `ProtocolClient` interface and the same reconnect supervisor; only
//! `connect`/`subscribe_or_poll`/`disconnect`/`test` differ per protocol.

pub mod modbus;
pub mod mqtt;
pub mod opcua;
pub mod reconnect;

use async_trait::async_trait;
use edge_model::RawRecord;

/// Errors a protocol client can report. The reconnect supervisor treats
/// `Fatal` as terminal for the source and everything else as retriable
/// (§4.1 failure semantics).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A connection or I/O failure; retried forever by the supervisor.
    #[error("transient error (source: {source_name}, reason: {reason})")]
    Transient {
        /// The source this error occurred on.
        source_name: String,
        /// The underlying reason.
        reason: String,
    },
    /// A configuration or schema error reported by the remote; fatal to this
    /// source, the loop does not retry.
    #[error("fatal configuration error (source: {source_name}, reason: {reason})")]
    Fatal {
        /// The source this error occurred on.
        source_name: String,
        /// The underlying reason.
        reason: String,
    },
}

impl Error {
    /// Whether the reconnect supervisor should keep retrying after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}

/// Connectivity test outcome, returned without side effects on a running
/// client (§4.1, §6).
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Whether the bounded connect-describe-disconnect succeeded.
    pub ok: bool,
    /// How long the probe took.
    pub duration_ms: u64,
    /// Free-form server identification string, if the probe reached the server.
    pub server_info: Option<String>,
    /// The error, if the probe failed.
    pub error: Option<String>,
}

/// Callback invoked once per successfully read or received value. Mirrors
/// `ProtocolClient.on_record` in the original implementation; the Rust model
/// keeps it synchronous because the normalizer call it triggers is itself
/// synchronous (§4.2).
pub trait OnRecord: Fn(RawRecord) + Send + Sync {}
impl<T: Fn(RawRecord) + Send + Sync> OnRecord for T {}

/// The interface shared by every protocol variant (§4.1).
#[async_trait]
pub trait ProtocolClient: Send {
    /// Establishes the connection. Walking the address space (OPC-UA),
    /// resolving the broker (MQTT), or opening the TCP socket (Modbus)
    /// happens here.
    async fn connect(&mut self) -> Result<(), Error>;

    /// Runs until disconnected or cancelled, invoking `on_record` for every
    /// value observed. Polling variants loop internally on their own cadence;
    /// subscription variants await notifications.
    async fn subscribe_or_poll(&mut self, on_record: &(dyn OnRecord)) -> Result<(), Error>;

    /// Disconnects cleanly. Called on every iteration of the reconnect loop,
    /// including after a failed `connect`/`subscribe_or_poll`.
    async fn disconnect(&mut self);

    /// A bounded connect-describe-disconnect probe with no side effects on a
    /// running client.
    async fn test(&mut self) -> TestResult;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_errors_are_retriable_fatal_errors_are_not() {
        let transient = Error::Transient { source_name: "s".into(), reason: "timeout".into() };
        let fatal = Error::Fatal { source_name: "s".into(), reason: "schema".into() };
        assert!(transient.is_retriable());
        assert!(!fatal.is_retriable());
    }
}
