use super::{Job, JobResult};
use crate::error::AppError;
use crate::health::HealthService;
use crate::revocation::RevocationStore;
use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Refreshes the `dependency_up` and `active_tokens` gauges.
pub struct DependencyProbeJob {
    health: Arc<HealthService>,
    store: Arc<dyn RevocationStore>,
    metrics: Option<PrometheusHandle>,
    interval: Duration,
}

impl DependencyProbeJob {
    pub fn new(
        health: Arc<HealthService>,
        store: Arc<dyn RevocationStore>,
        metrics: Option<PrometheusHandle>,
        interval: Duration,
    ) -> Self {
        Self {
            health,
            store,
            metrics,
            interval,
        }
    }
}

#[async_trait]
impl Job for DependencyProbeJob {
    fn name(&self) -> &str {
        "dependency_probe"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let report = self.health.check_health(None).await;
        let mut unhealthy = Vec::new();
        for (name, result) in &report.dependencies {
            crate::metrics::set_dependency_up(name, result.is_healthy());
            if !result.is_healthy() {
                unhealthy.push(name.as_str());
            }
        }

        match self.store.active_count().await {
            Ok(count) => crate::metrics::set_active_tokens(count),
            Err(err) => warn!(error = %err, "Could not refresh active token gauge"),
        }

        if let Some(handle) = &self.metrics {
            handle.run_upkeep();
        }

        if unhealthy.is_empty() {
            Ok(JobResult::success_with_count(report.dependencies.len() as u64))
        } else {
            Ok(JobResult::failure(format!(
                "Unhealthy dependencies: {}",
                unhealthy.join(", ")
            )))
        }
    }
}
