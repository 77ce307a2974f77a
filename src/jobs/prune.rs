use super::{Job, JobResult};
use crate::error::AppError;
use crate::rate_limit::RateLimitService;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Drops rate-limit buckets whose window has elapsed.
pub struct RateLimitPruneJob {
    limiter: Arc<RateLimitService>,
}

impl RateLimitPruneJob {
    pub fn new(limiter: Arc<RateLimitService>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Job for RateLimitPruneJob {
    fn name(&self) -> &str {
        "rate_limit_prune"
    }

    fn interval(&self) -> Duration {
        self.limiter.window().max(Duration::from_secs(1))
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let removed = self.limiter.prune();
        debug!(
            removed,
            remaining = self.limiter.tracked_clients(),
            "Pruned rate limit buckets"
        );
        Ok(JobResult::success_with_count(removed as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prune_job_uses_window_interval() {
        let limiter = Arc::new(RateLimitService::new(10, Duration::from_secs(60), false));
        limiter.check("192.0.2.1".parse().unwrap()).unwrap();

        let job = RateLimitPruneJob::new(limiter.clone());
        assert_eq!(job.interval(), Duration::from_secs(60));

        // The bucket's window is still open.
        let result = job.execute().await.unwrap();
        assert_eq!(result.items_processed, 0);
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
