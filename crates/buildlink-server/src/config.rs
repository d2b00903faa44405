//! Executor configuration, read from a TOML file.

use crate::keychain::{DEFAULT_CREDENTIAL_TIMEOUT, StaticKeychain};
use anyhow::Context;
use buildlink_core::RegistryAuth;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
    /// Only tokens issued for this builder are accepted. Empty accepts any.
    pub builder_uuid: String,
    /// Overrides the namespace recorded in each build request.
    pub namespace: Option<String>,
    /// Standard base64 X25519 secret key. A throwaway key is generated when unset.
    pub secret_key: Option<String>,
    /// Used when a token carries no push repository.
    pub push_repo: String,
    pub parallel_platforms: bool,
    pub credential_timeout_secs: u64,
    /// Default `tracing` directive, overridden by `RUST_LOG`.
    pub log_level: Option<String>,
    /// Fallback credentials for registries the client has nothing for.
    pub credentials: Vec<CredentialEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialEntry {
    pub server: String,
    pub username: String,
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            builder_uuid: String::new(),
            namespace: None,
            secret_key: None,
            push_repo: String::new(),
            parallel_platforms: false,
            credential_timeout_secs: DEFAULT_CREDENTIAL_TIMEOUT.as_secs(),
            log_level: None,
            credentials: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credential_timeout_secs)
    }

    pub fn fallback_keychain(&self) -> StaticKeychain {
        StaticKeychain::new(self.credentials.iter().map(|entry| {
            (
                entry.server.clone(),
                RegistryAuth::new(&entry.username, &entry.password),
            )
        }))
    }
}
