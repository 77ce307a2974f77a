use super::Job;
use std::sync::Arc;
use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{error, info, warn};

/// Runs each registered job on its own interval until shutdown.
pub struct JobScheduler {
    enabled: bool,
    handles: Arc<RwLock<Vec<JoinHandle<()>>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_coordinator: Option<watch::Receiver<bool>>,
}

impl JobScheduler {
    pub fn new(enabled: bool) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            enabled,
            handles: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
            shutdown_coordinator: None,
        }
    }

    /// Create JobScheduler with graceful shutdown integration
    pub fn with_shutdown_coordinator(enabled: bool, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            shutdown_coordinator: Some(shutdown_rx),
            ..Self::new(enabled)
        }
    }

    pub async fn start(&mut self, jobs: Vec<Arc<dyn Job>>) {
        if !self.enabled {
            info!("Job scheduler disabled in configuration");
            return;
        }

        info!("Starting job scheduler with {} jobs", jobs.len());

        let mut handles = self.handles.write().await;
        for job in jobs {
            handles.push(self.spawn_job(job));
        }
    }

    pub async fn running_jobs(&self) -> usize {
        let handles = self.handles.read().await;
        handles.iter().filter(|handle| !handle.is_finished()).count()
    }

    /// Stop the job scheduler and wait for every job loop to exit
    pub async fn stop(&mut self) {
        info!("Stopping job scheduler...");

        self.shutdown_tx.send_replace(true);

        let mut handles = self.handles.write().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Job handle failed during shutdown: {}", e);
            }
        }

        info!("Job scheduler stopped");
    }

    fn spawn_job(&self, job: Arc<dyn Job>) -> JoinHandle<()> {
        let interval_duration = job.interval();
        let job_name = job.name().to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut coordinator_rx = self.shutdown_coordinator.clone();

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + interval_duration, interval_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Job '{}' scheduled with interval {:?}",
                job_name, interval_duration
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // A run in progress is abandoned when shutdown arrives.
                        tokio::select! {
                            _ = run_once(job.as_ref(), &job_name) => {}
                            _ = wait_for_shutdown(&mut shutdown_rx, &mut coordinator_rx) => {
                                info!("Job '{}' interrupted by shutdown", job_name);
                                break;
                            }
                        }
                    }
                    _ = wait_for_shutdown(&mut shutdown_rx, &mut coordinator_rx) => {
                        info!("Job '{}' received shutdown signal", job_name);
                        break;
                    }
                }
            }

            info!("Job '{}' stopped", job_name);
        })
    }
}

async fn run_once(job: &dyn Job, job_name: &str) {
    match job.execute().await {
        Ok(result) if result.success => {
            info!("Job '{}' completed: {}", job_name, result.message);
        }
        Ok(result) => warn!("Job '{}' failed: {}", job_name, result.message),
        Err(e) => error!("Job '{}' execution error: {}", job_name, e),
    }
}

/// Resolves once either the scheduler or the global coordinator signals shutdown.
async fn wait_for_shutdown(
    internal: &mut watch::Receiver<bool>,
    coordinator: &mut Option<watch::Receiver<bool>>,
) {
    let internal_fut = internal.wait_for(|stop| *stop);
    match coordinator {
        Some(coordinator) => {
            tokio::select! {
                _ = internal_fut => {}
                _ = coordinator.wait_for(|stop| *stop) => {}
            }
        }
        None => {
            let _ = internal_fut.await;
        }
    }
}
