use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    signal,
    sync::{RwLock, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{error, info, warn};

/// Shared shutdown flag. Listeners, jobs and the key refresher all watch the same channel.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_requested: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Get a receiver for shutdown notifications
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    pub fn initiate_shutdown(&self) {
        if self
            .shutdown_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("Shutdown requested, draining listeners");
            // Every receiver lives in `self`, so the send cannot fail while we exist.
            let _ = self.shutdown_tx.send(true);
        }
    }

    /// Resolves once shutdown has been initiated by a signal or programmatically.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Wait for SIGTERM or Ctrl+C, then initiate shutdown
    pub async fn wait_for_shutdown_signal(&self) {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                error!(error = %err, "Ctrl+C handler unavailable");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!(signal = "SIGINT", "Received shutdown signal"),
            _ = terminate => info!(signal = "SIGTERM", "Received shutdown signal"),
            _ = self.wait_for_shutdown() => {},
        }

        self.initiate_shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// A component stopped by [`ShutdownManager`] after the listeners have drained.
#[async_trait::async_trait]
pub trait GracefulShutdown {
    fn name(&self) -> &str;

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Shuts registered components down in registration order, each bounded by the timeout
pub struct ShutdownManager {
    components: Vec<Box<dyn GracefulShutdown + Send + Sync>>,
    timeout_duration: Duration,
}

impl ShutdownManager {
    pub fn new(timeout_duration: Duration) -> Self {
        Self {
            components: Vec::new(),
            timeout_duration,
        }
    }

    pub fn register<T>(&mut self, component: T)
    where
        T: GracefulShutdown + Send + Sync + 'static,
    {
        self.components.push(Box::new(component));
    }

    /// Jobs stop before the database pool closes.
    pub fn register_server_components(&mut self, server: &crate::server::Server) {
        self.register(JobSchedulerShutdown::new(server.job_scheduler.clone()));
        self.register(DatabaseShutdown::new(server.database.clone()));
    }

    pub fn register_background_task(
        &mut self,
        task: JoinHandle<()>,
        name: &str,
        timeout_seconds: u64,
    ) {
        self.register(BackgroundTaskShutdown::new(
            name.to_string(),
            task,
            timeout_seconds,
        ));
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub async fn shutdown_all(&self) {
        info!(components = self.components.len(), "Stopping components");

        for component in &self.components {
            let name = component.name();
            match timeout(self.timeout_duration, component.shutdown()).await {
                Ok(Ok(())) => info!(component = name, "Component stopped"),
                Ok(Err(err)) => error!(component = name, error = %err, "Component failed to stop"),
                Err(_) => error!(
                    component = name,
                    timeout = ?self.timeout_duration,
                    "Component did not stop in time"
                ),
            }
        }

        info!("Shutdown complete");
    }
}

/// Closes the user store connection pool
pub struct DatabaseShutdown {
    database: Arc<dyn crate::database::DatabaseManager>,
}

impl DatabaseShutdown {
    pub fn new(database: Arc<dyn crate::database::DatabaseManager>) -> Self {
        Self { database }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for DatabaseShutdown {
    fn name(&self) -> &str {
        "user_store"
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Closing user store connections");
        self.database.close().await?;
        Ok(())
    }
}

/// Waits for a background task that watches the shutdown signal, aborting it when it
/// does not finish in time.
pub struct BackgroundTaskShutdown {
    name: String,
    task_handle: RwLock<Option<JoinHandle<()>>>,
    timeout_seconds: u64,
}

impl BackgroundTaskShutdown {
    pub fn new(name: String, task_handle: JoinHandle<()>, timeout_seconds: u64) -> Self {
        Self {
            name,
            task_handle: RwLock::new(Some(task_handle)),
            timeout_seconds,
        }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for BackgroundTaskShutdown {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(mut handle) = self.task_handle.write().await.take() else {
            return Ok(());
        };
        if handle.is_finished() {
            return Ok(());
        }

        if timeout(Duration::from_secs(self.timeout_seconds), &mut handle)
            .await
            .is_err()
        {
            warn!(
                task = %self.name,
                timeout_seconds = self.timeout_seconds,
                "Background task ignored shutdown, aborting"
            );
            handle.abort();
        }
        Ok(())
    }
}

pub struct JobSchedulerShutdown {
    job_scheduler: Arc<RwLock<crate::jobs::JobScheduler>>,
}

impl JobSchedulerShutdown {
    pub fn new(job_scheduler: Arc<RwLock<crate::jobs::JobScheduler>>) -> Self {
        Self { job_scheduler }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for JobSchedulerShutdown {
    fn name(&self) -> &str {
        "job_scheduler"
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut scheduler = self.job_scheduler.write().await;
        scheduler.stop().await;
        Ok(())
    }
}
