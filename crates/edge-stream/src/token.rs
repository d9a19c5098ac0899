//! OAuth2 client-credentials token exchange (§4.6, §9 Open Question: the
//! streaming RPC transport and its auth handshake are vendor-specific and
//! not fully specified, so this crate defines the narrow seam
//! (`TokenProvider`) the stream client calls through and ships one concrete
//! client-credentials implementation).

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;

use crate::StreamError;

/// Credentials resolved from the credential store for one destination.
#[derive(Debug, Clone)]
pub struct StreamCredentials {
    /// The OAuth2 token endpoint.
    pub token_url: String,
    /// Client id.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
}

/// A bearer token and its expiry.
#[derive(Debug, Clone)]
pub struct Token {
    /// The bearer token value.
    pub access_token: String,
    /// Milliseconds since the epoch at which the token expires.
    pub expires_at_ms: i64,
}

impl Token {
    /// Whether the token has expired, with a 30 s safety margin.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms.saturating_sub(30_000)
    }
}

/// Resolves a bearer token for a set of stream credentials. The default
/// implementation performs an OAuth2 client-credentials exchange; tests
/// substitute a fake.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Exchanges `creds` for a fresh token.
    async fn token(&self, creds: &StreamCredentials) -> Result<Token, StreamError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// An OAuth2 `client_credentials` grant token provider, backed by `reqwest`.
pub struct OAuth2TokenProvider {
    http: reqwest::Client,
}

impl OAuth2TokenProvider {
    /// Creates a provider with a dedicated HTTP client (connect timeout
    /// matches §5's control-plane budget).
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for OAuth2TokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for OAuth2TokenProvider {
    async fn token(&self, creds: &StreamCredentials) -> Result<Token, StreamError> {
        let response = self
            .http
            .post(&creds.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|err| StreamError::Retriable { reason: format!("token exchange request failed: {err}") })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED || response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(StreamError::NonRetriable { reason: format!("token exchange rejected: {}", response.status()) });
        }
        if !response.status().is_success() {
            return Err(StreamError::Retriable { reason: format!("token exchange returned {}", response.status()) });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| StreamError::Retriable { reason: format!("token response was not valid json: {err}") })?;

        Ok(Token {
            access_token: body.access_token,
            expires_at_ms: now_ms() + body.expires_in * 1000,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_expiry_has_safety_margin() {
        let token = Token { access_token: "t".into(), expires_at_ms: 100_000 };
        assert!(!token.is_expired(50_000));
        assert!(token.is_expired(69_999));
        assert!(token.is_expired(100_000));
    }
}
