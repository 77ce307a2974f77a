//! Cached copy of the issuer's public key.
//!
//! The key is fetched on first use. Once the TTL lapses the old key keeps being served while a
//! single background task refreshes it, so only the very first fetch ever blocks a request. A
//! failed refresh keeps the last good key.

use super::error::VerifyError;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a stale key is served before the next refresh attempt.
const STALE_RETRY_DELAY: Duration = Duration::from_secs(30);

enum KeySource {
    Remote { client: reqwest::Client, url: String },
    Static(DecodingKey),
}

struct CachedKey {
    key: DecodingKey,
    expires_at: Instant,
}

struct KeyState {
    source: KeySource,
    ttl: Duration,
    cached: RwLock<Option<CachedKey>>,
    refresh_lock: Mutex<()>,
    /// Set while a background refresh task is in flight.
    refreshing: AtomicBool,
}

pub struct PublicKeyCache {
    state: Arc<KeyState>,
}

impl std::fmt::Debug for PublicKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.state.source {
            KeySource::Remote { url, .. } => url.as_str(),
            KeySource::Static(_) => "static",
        };
        f.debug_struct("PublicKeyCache")
            .field("source", &source)
            .field("ttl", &self.state.ttl)
            .finish_non_exhaustive()
    }
}

impl PublicKeyCache {
    fn with_source(source: KeySource, ttl: Duration) -> Self {
        Self {
            state: Arc::new(KeyState {
                source,
                ttl,
                cached: RwLock::new(None),
                refresh_lock: Mutex::new(()),
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Key fetched over HTTP from a `/public-key.pem`, `/public-key` or `/jwks` URL.
    pub fn remote(
        url: impl Into<String>,
        ttl: Duration,
        fetch_timeout: Duration,
    ) -> Result<Self, VerifyError> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| VerifyError::KeyUnavailable(e.to_string()))?;

        Ok(Self::with_source(
            KeySource::Remote {
                client,
                url: url.into(),
            },
            ttl,
        ))
    }

    /// Fixed key for in-process verification; never refreshed.
    pub fn from_key(key: DecodingKey) -> Self {
        Self::with_source(KeySource::Static(key), Duration::MAX)
    }

    pub fn from_pem(pem: &str) -> Result<Self, VerifyError> {
        parse_public_key(pem)
            .map(Self::from_key)
            .map_err(VerifyError::KeyUnavailable)
    }

    /// Key to verify with. Waits on the network only when no key has been fetched yet; an
    /// expired key is returned as is and refreshed in the background.
    pub async fn current(&self) -> Result<DecodingKey, VerifyError> {
        if let KeySource::Static(key) = &self.state.source {
            return Ok(key.clone());
        }

        if let Some((key, fresh)) = self.state.cached_key().await {
            if !fresh {
                self.spawn_refresh();
            }
            return Ok(key);
        }

        let _guard = self.state.refresh_lock.lock().await;
        // Another caller may have finished the first fetch while we waited.
        if let Some((key, _)) = self.state.cached_key().await {
            return Ok(key);
        }
        self.state.refresh_locked().await
    }

    /// Unconditional refresh, used by the background refresher.
    pub async fn refresh(&self) -> Result<(), VerifyError> {
        if matches!(self.state.source, KeySource::Static(_)) {
            return Ok(());
        }
        let _guard = self.state.refresh_lock.lock().await;
        self.state.refresh_locked().await.map(|_| ())
    }

    pub async fn has_key(&self) -> bool {
        matches!(self.state.source, KeySource::Static(_))
            || self.state.cached.read().await.is_some()
    }

    /// Starts a refresh task unless one is already running.
    fn spawn_refresh(&self) {
        if self
            .state
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            {
                let _guard = state.refresh_lock.lock().await;
                let still_stale = !matches!(state.cached_key().await, Some((_, true)));
                if still_stale {
                    if let Err(err) = state.refresh_locked().await {
                        debug!(error = %err, "Background key refresh failed");
                    }
                }
            }
            state.refreshing.store(false, Ordering::Release);
        });
    }
}

impl KeyState {
    /// Cached key and whether it is still within its TTL.
    async fn cached_key(&self) -> Option<(DecodingKey, bool)> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .map(|entry| (entry.key.clone(), entry.expires_at > Instant::now()))
    }

    /// Caller must hold `refresh_lock`.
    async fn refresh_locked(&self) -> Result<DecodingKey, VerifyError> {
        match self.fetch().await {
            Ok(key) => {
                crate::metrics::track_public_key_refresh(true);
                let mut cached = self.cached.write().await;
                *cached = Some(CachedKey {
                    key: key.clone(),
                    expires_at: Instant::now()
                        .checked_add(self.ttl)
                        .unwrap_or_else(|| Instant::now() + STALE_RETRY_DELAY),
                });
                Ok(key)
            }
            Err(reason) => {
                crate::metrics::track_public_key_refresh(false);
                let mut cached = self.cached.write().await;
                match cached.as_mut() {
                    Some(stale) => {
                        warn!(error = %reason, "Public key refresh failed, keeping previous key");
                        stale.expires_at = Instant::now() + STALE_RETRY_DELAY;
                        Ok(stale.key.clone())
                    }
                    None => {
                        warn!(error = %reason, "Public key unavailable");
                        Err(VerifyError::KeyUnavailable(reason))
                    }
                }
            }
        }
    }

    async fn fetch(&self) -> Result<DecodingKey, String> {
        let KeySource::Remote { client, url } = &self.source else {
            return Err("static key source cannot be fetched".to_string());
        };

        debug!(url = %url, "Fetching issuer public key");
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request to {url} failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("{url} answered {}", response.status()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| format!("reading {url} failed: {e}"))?;
        parse_public_key(&body)
    }
}

/// Accepts a PEM public key, a JWKS document, a single JWK, or the issuer's
/// `{"public_key": "<PEM>"}` wrapper.
pub fn parse_public_key(body: &str) -> Result<DecodingKey, String> {
    let trimmed = body.trim_start();
    if !trimmed.starts_with('{') {
        return DecodingKey::from_rsa_pem(trimmed.as_bytes())
            .map_err(|e| format!("invalid PEM public key: {e}"));
    }

    let value: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| format!("invalid key JSON: {e}"))?;

    if let Some(pem) = value.get("public_key").and_then(|v| v.as_str()) {
        return DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| format!("invalid PEM public key: {e}"));
    }

    let jwk = if value.get("keys").is_some() {
        let set: JwkSet = serde_json::from_value(value).map_err(|e| format!("invalid JWKS: {e}"))?;
        set.keys
            .into_iter()
            .find(|jwk| {
                matches!(
                    jwk.algorithm,
                    jsonwebtoken::jwk::AlgorithmParameters::RSA(_)
                )
            })
            .ok_or_else(|| "JWKS contains no RSA key".to_string())?
    } else {
        serde_json::from_value::<Jwk>(value).map_err(|e| format!("invalid JWK: {e}"))?
    };

    DecodingKey::from_jwk(&jwk).map_err(|e| format!("unusable JWK: {e}"))
}

/// Refreshes `cache` every `interval` until `shutdown` flips to true.
pub fn spawn_key_refresher(
    cache: Arc<PublicKeyCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = cache.refresh().await {
                        debug!(error = %err, "Background key refresh failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Public key refresher stopped");
                        break;
                    }
                }
            }
        }
    })
}
