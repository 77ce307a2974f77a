use crate::auth::config::DEFAULT_ISSUER;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the verifier does when the revocation store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Accept tokens whose signature and expiry check out.
    #[default]
    Open,
    /// Reject with `503 revocation_unavailable`.
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Issuer `/public-key.pem` or `/jwks` URL.
    #[serde(default = "default_key_url")]
    pub key_url: String,
    #[serde(default = "default_key_cache_ttl_seconds")]
    pub key_cache_ttl_seconds: u64,
    #[serde(default = "default_key_refresh_interval_seconds")]
    pub key_refresh_interval_seconds: u64,
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
    #[serde(default = "default_revocation_timeout_ms")]
    pub revocation_timeout_ms: u64,
    #[serde(default)]
    pub fail_mode: FailMode,
    /// Tokens from any other issuer are rejected.
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

fn default_key_url() -> String {
    "http://localhost:8080/public-key.pem".to_string()
}

fn default_issuer() -> String {
    DEFAULT_ISSUER.to_string()
}

fn default_key_cache_ttl_seconds() -> u64 {
    300
}

fn default_key_refresh_interval_seconds() -> u64 {
    300
}

fn default_fetch_timeout_seconds() -> u64 {
    10
}

fn default_revocation_timeout_ms() -> u64 {
    2000
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            key_url: default_key_url(),
            key_cache_ttl_seconds: default_key_cache_ttl_seconds(),
            key_refresh_interval_seconds: default_key_refresh_interval_seconds(),
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
            revocation_timeout_ms: default_revocation_timeout_ms(),
            fail_mode: FailMode::default(),
            issuer: default_issuer(),
        }
    }
}

impl VerifierConfig {
    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_seconds)
    }

    pub fn key_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.key_refresh_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn revocation_timeout(&self) -> Duration {
        Duration::from_millis(self.revocation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VerifierConfig::default();
        assert_eq!(config.key_cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.key_refresh_interval(), Duration::from_secs(300));
        assert_eq!(config.revocation_timeout(), Duration::from_secs(2));
        assert_eq!(config.fail_mode, FailMode::Open);
        assert_eq!(config.issuer, "game-auth");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: VerifierConfig = serde_json::from_value(serde_json::json!({
            "key_url": "https://auth.example.com/jwks",
            "fail_mode": "closed",
        }))
        .unwrap();
        assert_eq!(config.key_url, "https://auth.example.com/jwks");
        assert_eq!(config.fail_mode, FailMode::Closed);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.issuer, DEFAULT_ISSUER);
    }

    #[test]
    fn test_configured_issuer() {
        let config: VerifierConfig = serde_json::from_value(serde_json::json!({
            "issuer": "auth.example.com",
        }))
        .unwrap();
        assert_eq!(config.issuer, "auth.example.com");
    }
}
