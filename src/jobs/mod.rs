pub mod cleanup;
pub mod probe;
pub mod prune;
pub mod scheduler;

use crate::error::AppError;
use async_trait::async_trait;
use std::time::Duration;

pub use cleanup::{TokenCleanupJob, run_cleanup};
pub use probe::DependencyProbeJob;
pub use prune::RateLimitPruneJob;
pub use scheduler::JobScheduler;

/// Result of job execution
#[derive(Debug, Clone)]
pub struct JobResult {
    pub success: bool,
    pub message: String,
    pub items_processed: u64,
}

impl JobResult {
    pub fn success_with_count(count: u64) -> Self {
        Self {
            success: true,
            message: format!("Successfully processed {count} items"),
            items_processed: count,
        }
    }

    pub fn success_with_message(message: String, count: u64) -> Self {
        Self {
            success: true,
            message,
            items_processed: count,
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            success: false,
            message,
            items_processed: 0,
        }
    }
}

/// Trait for periodic background jobs
#[async_trait]
pub trait Job: Send + Sync {
    /// Job name for logging and identification
    fn name(&self) -> &str;

    /// Time between runs; the first run happens one interval after start.
    /// Jobs that can stall bound their own runs.
    fn interval(&self) -> Duration;

    async fn execute(&self) -> Result<JobResult, AppError>;
}
