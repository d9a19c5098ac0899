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

//! The credential store is an external collaborator (§1, §6): credential-at-
//! rest encryption and the on-disk format are out of scope for the core. This
//! crate defines only the narrow interface the core consumes (`get`/`set`)
//! plus an environment-variable-backed implementation suitable for
//! development and for resolving `${credential:<key>}` placeholders at
//! config-load time.

use std::collections::HashMap;
use std::env;
use std::sync::RwLock;

use async_trait::async_trait;

/// Errors returned by a `CredentialStore`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The requested key has no value in the store.
    #[error("credential '{key}' not found")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },
    /// The store backend failed for some other reason.
    #[error("credential store error (reason: {reason})")]
    Backend {
        /// The error message.
        reason: String,
    },
}

/// The credential store interface consumed by the core (§6). The core never
/// reads or writes credential files directly; it only calls `get`/`set` on an
/// implementation of this trait, pulling credentials per connect attempt
/// rather than caching them (§5, §9).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns the value for `key`, or `Ok(None)` if it is not present.
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Sets `key` to `value`. Returns whether the value was newly inserted.
    async fn set(&self, key: &str, value: &str) -> Result<bool, Error>;
}

/// A credential store backed by `CREDENTIAL_STORE_*` environment variables
/// and an in-process override map, used for local runs and tests. A
/// production deployment replaces this with an encrypted-at-rest backend;
/// this crate does not implement one (§1 Non-goals: "credential-at-rest
/// encryption").
#[derive(Default)]
pub struct EnvCredentialStore {
    overrides: RwLock<HashMap<String, String>>,
}

impl EnvCredentialStore {
    /// Creates a new, empty environment-backed credential store.
    pub fn new() -> Self {
        Self::default()
    }

    fn env_var_name(key: &str) -> String {
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("CREDENTIAL_STORE_{sanitized}")
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        if let Some(v) = self
            .overrides
            .read()
            .map_err(|e| Error::Backend { reason: e.to_string() })?
            .get(key)
        {
            return Ok(Some(v.clone()));
        }
        Ok(env::var(Self::env_var_name(key)).ok())
    }

    async fn set(&self, key: &str, value: &str) -> Result<bool, Error> {
        let mut guard = self.overrides.write().map_err(|e| Error::Backend { reason: e.to_string() })?;
        Ok(guard.insert(key.to_string(), value.to_string()).is_none())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn set_then_get_overrides_env() {
        let store = EnvCredentialStore::new();
        assert_eq!(store.get("zerobus-prod").await.unwrap(), None);
        assert!(store.set("zerobus-prod", "s3cr3t").await.unwrap());
        assert_eq!(store.get("zerobus-prod").await.unwrap(), Some("s3cr3t".to_string()));
        // re-setting the same key is not a fresh insertion
        assert!(!store.set("zerobus-prod", "rotated").await.unwrap());
    }
}
