use super::{
    CleanupReport, LiveToken, RevocationError, RevocationResult, RevocationStats,
    RevocationStore, TokenRegistration, revoked_key, token_key,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    /// key -> (value, expiry in unix milliseconds)
    values: HashMap<String, (String, i64)>,
    /// user id -> token id -> expiry score (unix seconds)
    indices: HashMap<String, HashMap<String, i64>>,
}

impl MemoryState {
    fn get_live(&mut self, key: &str, now_ms: i64) -> Option<(String, i64)> {
        match self.values.get(key) {
            Some((_, expires_at)) if *expires_at <= now_ms => {
                self.values.remove(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    fn purge_expired(&mut self, now_ms: i64) {
        self.values.retain(|_, (_, expires_at)| *expires_at > now_ms);
    }
}

/// Single-process revocation store with the same TTL semantics as the Redis backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryRevocationStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a raw index entry without a registration record, e.g. to model an index
    /// entry whose registration already expired.
    pub async fn insert_index_entry(&self, user_id: &str, token_id: &str, expires_at: i64) {
        let mut state = self.state.write().await;
        state
            .indices
            .entry(user_id.to_string())
            .or_default()
            .insert(token_id.to_string(), expires_at);
    }

    pub async fn index_len(&self, user_id: &str) -> usize {
        let state = self.state.read().await;
        state.indices.get(user_id).map_or(0, HashMap::len)
    }

    /// Remaining lifetime of a key in milliseconds, `None` when absent.
    pub async fn ttl_millis(&self, key: &str) -> Option<i64> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.write().await;
        state
            .get_live(key, now_ms)
            .map(|(_, expires_at)| expires_at - now_ms)
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn register_token(
        &self,
        token_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> RevocationResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_ms = expires_at.timestamp_millis();
        if expires_ms <= now_ms {
            return Err(RevocationError::InvalidExpiry);
        }

        let record = serde_json::to_string(&TokenRegistration {
            user_id: user_id.to_string(),
            expires_at: expires_at.timestamp(),
        })?;

        let mut state = self.state.write().await;
        state.values.insert(token_key(token_id), (record, expires_ms));
        state
            .indices
            .entry(user_id.to_string())
            .or_default()
            .insert(token_id.to_string(), expires_at.timestamp());
        Ok(())
    }

    async fn revoke(&self, token_id: &str) -> RevocationResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.write().await;

        let registration_key = token_key(token_id);
        let Some((_, expires_ms)) = state.get_live(&registration_key, now_ms) else {
            return Ok(false);
        };

        state.values.remove(&registration_key);
        state.values.insert(
            revoked_key(token_id),
            (super::TOMBSTONE_VALUE.to_string(), expires_ms),
        );
        Ok(true)
    }

    async fn is_revoked(&self, token_id: &str) -> RevocationResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.write().await;
        Ok(state.get_live(&revoked_key(token_id), now_ms).is_some())
    }

    async fn list_user_tokens(&self, user_id: &str) -> RevocationResult<Vec<LiveToken>> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let mut state = self.state.write().await;

        let candidates: Vec<(String, i64)> = state
            .indices
            .get(user_id)
            .map(|index| {
                index
                    .iter()
                    .filter(|(_, score)| **score > now.timestamp())
                    .map(|(token_id, score)| (token_id.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();

        let mut tokens: Vec<LiveToken> = candidates
            .into_iter()
            .filter(|(token_id, _)| state.get_live(&token_key(token_id), now_ms).is_some())
            .map(|(token_id, expires_at)| LiveToken {
                token_id,
                expires_at,
            })
            .collect();
        tokens.sort_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then_with(|| a.token_id.cmp(&b.token_id))
        });
        Ok(tokens)
    }

    async fn cleanup_expired(&self) -> RevocationResult<CleanupReport> {
        let now = Utc::now().timestamp();
        let mut state = self.state.write().await;
        state.purge_expired(now * 1000);

        let mut report = CleanupReport::default();
        for index in state.indices.values_mut() {
            report.users_seen += 1;
            let before = index.len();
            index.retain(|_, score| *score > now);
            report.expired_count += (before - index.len()) as u64;
        }
        state.indices.retain(|_, index| !index.is_empty());
        Ok(report)
    }

    async fn active_count(&self) -> RevocationResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.write().await;
        state.purge_expired(now_ms);
        Ok(state
            .values
            .keys()
            .filter(|key| key.starts_with("token:"))
            .count() as u64)
    }

    async fn stats(&self) -> RevocationResult<RevocationStats> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.write().await;
        state.purge_expired(now_ms);

        let count_prefix = |prefix: &str| {
            state
                .values
                .keys()
                .filter(|key| key.starts_with(prefix))
                .count() as u64
        };
        Ok(RevocationStats {
            active_tokens: count_prefix("token:"),
            revoked_tokens: count_prefix("revoked:"),
            indexed_users: state.indices.len() as u64,
        })
    }

    async fn ping(&self) -> RevocationResult<()> {
        Ok(())
    }
}
