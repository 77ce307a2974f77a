use super::{
    CleanupReport, LiveToken, REVOKED_KEY_PATTERN, RedisConfig, RevocationError,
    RevocationResult, RevocationStats, RevocationStore, TOKEN_KEY_PATTERN, TOMBSTONE_VALUE,
    TokenRegistration, USER_INDEX_PATTERN, revoked_key, token_key, user_index_key,
};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const SCAN_BATCH: usize = 200;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Redis-backed store. Holds a fixed number of multiplexed connections handed out
/// round-robin; a connection that fails is dropped and re-established on next use.
pub struct RedisRevocationStore {
    client: Client,
    slots: Vec<Mutex<Option<MultiplexedConnection>>>,
    next_slot: AtomicUsize,
    operation_timeout: Duration,
    max_retries: u32,
    scan_limit: usize,
}

impl RedisRevocationStore {
    /// Builds the store without touching the network.
    pub fn new(config: &RedisConfig) -> RevocationResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| RevocationError::Connection(format!("invalid redis url: {e}")))?;
        let pool_size = config.max_connections.max(1);

        Ok(Self {
            client,
            slots: (0..pool_size).map(|_| Mutex::new(None)).collect(),
            next_slot: AtomicUsize::new(0),
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
            max_retries: config.max_retries,
            scan_limit: config.scan_limit,
        })
    }

    /// Builds the store and verifies connectivity with a `PING`.
    pub async fn connect(config: &RedisConfig) -> RevocationResult<Self> {
        let store = Self::new(config)?;
        store.ping().await?;
        Ok(store)
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Best effort: managed Redis offerings usually reject `CONFIG SET`.
    pub async fn apply_persistence_settings(&self, config: &RedisConfig) {
        let appendonly = if config.aof_enabled { "yes" } else { "no" }.to_string();
        let save = format!("{} 1", config.save_interval_seconds);

        for (parameter, value) in [("appendonly", appendonly), ("save", save)] {
            let result = self
                .execute("config_set", {
                    let value = value.clone();
                    move |mut conn| {
                        let value = value.clone();
                        async move {
                            redis::cmd("CONFIG")
                                .arg("SET")
                                .arg(parameter)
                                .arg(&value)
                                .query_async::<()>(&mut conn)
                                .await
                        }
                    }
                })
                .await;

            match result {
                Ok(()) => info!(parameter, value = %value, "Applied Redis persistence setting"),
                Err(err) => warn!(
                    parameter,
                    error = %err,
                    "Could not apply Redis persistence setting"
                ),
            }
        }
    }

    async fn connection(&self, slot: usize) -> RevocationResult<MultiplexedConnection> {
        let mut guard = self.slots[slot].lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(
            self.operation_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| RevocationError::Timeout(self.operation_timeout))?
        .map_err(|e| RevocationError::Connection(e.to_string()))?;

        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn discard(&self, slot: usize) {
        *self.slots[slot].lock().await = None;
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: INITIAL_BACKOFF,
            initial_interval: INITIAL_BACKOFF,
            max_interval: MAX_BACKOFF,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Runs one command with the per-operation timeout, retrying transient failures.
    async fn execute<T, F, Fut>(&self, operation: &'static str, command: F) -> RevocationResult<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let started = Instant::now();
        let result = self.execute_with_retry(operation, command).await;
        crate::metrics::track_revocation_operation(operation, result.is_ok(), started.elapsed());
        result
    }

    async fn execute_with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        command: F,
    ) -> RevocationResult<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut backoff = self.backoff();
        let mut attempt = 0u32;

        loop {
            let failure = match self.connection(slot).await {
                Ok(conn) => match tokio::time::timeout(self.operation_timeout, command(conn)).await
                {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(err)) if is_transient(&err) => {
                        RevocationError::Connection(err.to_string())
                    }
                    Ok(Err(err)) => return Err(RevocationError::Store(err.to_string())),
                    Err(_) => RevocationError::Timeout(self.operation_timeout),
                },
                Err(err) => err,
            };

            self.discard(slot).await;
            if attempt >= self.max_retries {
                return Err(failure);
            }
            attempt += 1;

            let delay = backoff.next_backoff().unwrap_or(MAX_BACKOFF);
            debug!(operation, attempt, error = %failure, "Retrying revocation store operation");
            tokio::time::sleep(delay).await;
        }
    }

    async fn delete(&self, operation: &'static str, key: String) -> RevocationResult<()> {
        self.execute(operation, move |mut conn| {
            let key = key.clone();
            async move { redis::cmd("DEL").arg(&key).query_async::<()>(&mut conn).await }
        })
        .await
    }

    async fn scan_page(
        &self,
        cursor: u64,
        pattern: &'static str,
    ) -> RevocationResult<(u64, Vec<String>)> {
        self.execute("scan", move |mut conn| async move {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
        })
        .await
    }

    /// Counts keys matching `pattern`, visiting at most `scan_limit` of them.
    async fn count_keys(&self, pattern: &'static str) -> RevocationResult<u64> {
        let mut cursor = 0u64;
        let mut count = 0usize;
        loop {
            let (next, keys) = self.scan_page(cursor, pattern).await?;
            count += keys.len();
            if next == 0 || count >= self.scan_limit {
                break;
            }
            cursor = next;
        }
        Ok(count.min(self.scan_limit) as u64)
    }
}

fn is_transient(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn register_token(
        &self,
        token_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> RevocationResult<()> {
        let ttl_ms = (expires_at - Utc::now()).num_milliseconds();
        if ttl_ms <= 0 {
            return Err(RevocationError::InvalidExpiry);
        }

        let record = serde_json::to_string(&TokenRegistration {
            user_id: user_id.to_string(),
            expires_at: expires_at.timestamp(),
        })?;
        let registration_key = token_key(token_id);

        self.execute("register_token", {
            let key = registration_key.clone();
            move |mut conn| {
                let key = key.clone();
                let record = record.clone();
                async move {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(&record)
                        .arg("PX")
                        .arg(ttl_ms)
                        .query_async::<()>(&mut conn)
                        .await
                }
            }
        })
        .await?;

        let index_key = user_index_key(user_id);
        let member = token_id.to_string();
        let score = expires_at.timestamp();
        let indexed = self
            .execute("index_token", move |mut conn| {
                let index_key = index_key.clone();
                let member = member.clone();
                async move {
                    redis::cmd("ZADD")
                        .arg(&index_key)
                        .arg(score)
                        .arg(&member)
                        .query_async::<()>(&mut conn)
                        .await
                }
            })
            .await;

        if let Err(err) = indexed {
            warn!(token_id, user_id, error = %err, "Failed to index token, rolling back registration");
            if let Err(rollback_err) = self
                .delete("rollback_registration", registration_key)
                .await
            {
                error!(token_id, error = %rollback_err, "Failed to roll back token registration");
            }
            return Err(err);
        }

        Ok(())
    }

    async fn revoke(&self, token_id: &str) -> RevocationResult<bool> {
        let registration_key = token_key(token_id);

        let pttl: i64 = self
            .execute("registration_ttl", {
                let key = registration_key.clone();
                move |mut conn| {
                    let key = key.clone();
                    async move { redis::cmd("PTTL").arg(&key).query_async::<i64>(&mut conn).await }
                }
            })
            .await?;

        let ttl_ms = match pttl {
            ms if ms > 0 => ms,
            // Present without expiry: fall back to the expiry stored in the record.
            -1 => {
                let raw: Option<String> = self
                    .execute("get_registration", {
                        let key = registration_key.clone();
                        move |mut conn| {
                            let key = key.clone();
                            async move {
                                redis::cmd("GET")
                                    .arg(&key)
                                    .query_async::<Option<String>>(&mut conn)
                                    .await
                            }
                        }
                    })
                    .await?;
                let Some(raw) = raw else {
                    return Ok(false);
                };
                let record: TokenRegistration = serde_json::from_str(&raw)?;
                record.expires_at * 1000 - Utc::now().timestamp_millis()
            }
            _ => return Ok(false),
        };

        if ttl_ms <= 0 {
            return Ok(false);
        }

        let tombstone_key = revoked_key(token_id);
        self.execute("revoke_token", move |mut conn| {
            let tombstone_key = tombstone_key.clone();
            let registration_key = registration_key.clone();
            async move {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .cmd("SET")
                    .arg(&tombstone_key)
                    .arg(TOMBSTONE_VALUE)
                    .arg("PX")
                    .arg(ttl_ms)
                    .ignore()
                    .cmd("DEL")
                    .arg(&registration_key)
                    .ignore();
                pipe.query_async::<()>(&mut conn).await
            }
        })
        .await?;

        Ok(true)
    }

    async fn is_revoked(&self, token_id: &str) -> RevocationResult<bool> {
        let key = revoked_key(token_id);
        self.execute("is_revoked", move |mut conn| {
            let key = key.clone();
            async move { redis::cmd("EXISTS").arg(&key).query_async::<bool>(&mut conn).await }
        })
        .await
    }

    async fn list_user_tokens(&self, user_id: &str) -> RevocationResult<Vec<LiveToken>> {
        let index_key = user_index_key(user_id);
        let now = Utc::now().timestamp();

        let entries: Vec<(String, f64)> = self
            .execute("list_user_tokens", move |mut conn| {
                let index_key = index_key.clone();
                async move {
                    redis::cmd("ZRANGEBYSCORE")
                        .arg(&index_key)
                        .arg(format!("({now}"))
                        .arg("+inf")
                        .arg("WITHSCORES")
                        .query_async::<Vec<(String, f64)>>(&mut conn)
                        .await
                }
            })
            .await?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = entries.iter().map(|(id, _)| token_key(id)).collect();
        let registered: Vec<bool> = self
            .execute("check_registrations", move |mut conn| {
                let keys = keys.clone();
                async move {
                    let mut pipe = redis::pipe();
                    for key in &keys {
                        pipe.cmd("EXISTS").arg(key);
                    }
                    pipe.query_async::<Vec<bool>>(&mut conn).await
                }
            })
            .await?;

        Ok(entries
            .into_iter()
            .zip(registered)
            .filter(|(_, registered)| *registered)
            .map(|((token_id, score), _)| LiveToken {
                token_id,
                expires_at: score as i64,
            })
            .collect())
    }

    async fn cleanup_expired(&self) -> RevocationResult<CleanupReport> {
        let now = Utc::now().timestamp();
        let mut report = CleanupReport::default();
        let mut seen = HashSet::new();
        let mut cursor = 0u64;

        loop {
            let (next, keys) = self.scan_page(cursor, USER_INDEX_PATTERN).await?;
            for key in keys {
                // SCAN may return a key more than once.
                if !seen.insert(key.clone()) {
                    continue;
                }
                let removed: u64 = self
                    .execute("cleanup_index", move |mut conn| {
                        let key = key.clone();
                        async move {
                            redis::cmd("ZREMRANGEBYSCORE")
                                .arg(&key)
                                .arg("-inf")
                                .arg(now)
                                .query_async::<u64>(&mut conn)
                                .await
                        }
                    })
                    .await?;
                report.users_seen += 1;
                report.expired_count += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(report)
    }

    async fn active_count(&self) -> RevocationResult<u64> {
        self.count_keys(TOKEN_KEY_PATTERN).await
    }

    async fn stats(&self) -> RevocationResult<RevocationStats> {
        Ok(RevocationStats {
            active_tokens: self.count_keys(TOKEN_KEY_PATTERN).await?,
            revoked_tokens: self.count_keys(REVOKED_KEY_PATTERN).await?,
            indexed_users: self.count_keys(USER_INDEX_PATTERN).await?,
        })
    }

    async fn ping(&self) -> RevocationResult<()> {
        let _: String = self
            .execute("ping", |mut conn| async move {
                redis::cmd("PING").query_async::<String>(&mut conn).await
            })
            .await?;
        Ok(())
    }
}
