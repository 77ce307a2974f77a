use super::{Job, JobResult};
use crate::error::AppError;
use crate::revocation::{CleanupReport, RevocationError, RevocationStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One sweep of the per-user token indices, bounded by `timeout`.
///
/// Shared by the scheduled job, the admin endpoint and the `maintenance cleanup` command.
pub async fn run_cleanup(
    store: &dyn RevocationStore,
    timeout: Duration,
) -> Result<CleanupReport, AppError> {
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, store.cleanup_expired()).await {
        Ok(result) => result,
        Err(_) => Err(RevocationError::Timeout(timeout)),
    };

    match &result {
        Ok(report) => {
            crate::metrics::track_cleanup_run(true, report.expired_count);
            info!(
                expired_count = report.expired_count,
                users_seen = report.users_seen,
                duration_ms = start.elapsed().as_millis() as u64,
                "Token index cleanup completed"
            );
        }
        Err(err) => {
            crate::metrics::track_cleanup_run(false, 0);
            warn!(error = %err, "Token index cleanup failed");
        }
    }

    result.map_err(AppError::from)
}

/// Periodically strips expired entries from the per-user token indices.
pub struct TokenCleanupJob {
    store: Arc<dyn RevocationStore>,
    interval: Duration,
    timeout: Duration,
}

impl TokenCleanupJob {
    pub fn new(store: Arc<dyn RevocationStore>, interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            interval,
            timeout,
        }
    }
}

#[async_trait]
impl Job for TokenCleanupJob {
    fn name(&self) -> &str {
        "token_cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let report = run_cleanup(self.store.as_ref(), self.timeout).await?;
        Ok(JobResult::success_with_message(
            format!(
                "Removed {} expired index entries across {} users",
                report.expired_count, report.users_seen
            ),
            report.expired_count,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revocation::{LiveToken, MemoryRevocationStore, RevocationResult, RevocationStats};
    use chrono::{DateTime, Utc};

    /// Memory store whose sweep never finishes.
    struct StalledSweepStore(MemoryRevocationStore);

    #[async_trait]
    impl RevocationStore for StalledSweepStore {
        fn backend(&self) -> &'static str {
            "stalled"
        }
        async fn register_token(
            &self,
            token_id: &str,
            user_id: &str,
            expires_at: DateTime<Utc>,
        ) -> RevocationResult<()> {
            self.0.register_token(token_id, user_id, expires_at).await
        }
        async fn revoke(&self, token_id: &str) -> RevocationResult<bool> {
            self.0.revoke(token_id).await
        }
        async fn is_revoked(&self, token_id: &str) -> RevocationResult<bool> {
            self.0.is_revoked(token_id).await
        }
        async fn list_user_tokens(&self, user_id: &str) -> RevocationResult<Vec<LiveToken>> {
            self.0.list_user_tokens(user_id).await
        }
        async fn cleanup_expired(&self) -> RevocationResult<CleanupReport> {
            std::future::pending().await
        }
        async fn active_count(&self) -> RevocationResult<u64> {
            self.0.active_count().await
        }
        async fn stats(&self) -> RevocationResult<RevocationStats> {
            self.0.stats().await
        }
        async fn ping(&self) -> RevocationResult<()> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_cleanup_job_reports_expired_entries() {
        let store = Arc::new(MemoryRevocationStore::new());
        let past = Utc::now().timestamp() - 60;
        store.insert_index_entry("u1", "old-1", past).await;
        store.insert_index_entry("u1", "old-2", past).await;

        let job = TokenCleanupJob::new(
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );
        assert_eq!(job.name(), "token_cleanup");

        let result = job.execute().await.unwrap();
        assert!(result.success);
        assert_eq!(result.items_processed, 2);

        let again = job.execute().await.unwrap();
        assert_eq!(again.items_processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sweep_is_cut_at_the_cleanup_timeout() {
        let job = TokenCleanupJob::new(
            Arc::new(StalledSweepStore(MemoryRevocationStore::new())),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );

        let started = tokio::time::Instant::now();
        let err = job.execute().await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Revocation(RevocationError::Timeout(limit)) if limit == Duration::from_secs(300)
        ));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(300) && elapsed < Duration::from_secs(301));
    }
}
