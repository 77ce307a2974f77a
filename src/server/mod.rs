pub mod config;
pub mod middleware;

use crate::{
    auth::{LoginService, TokenService},
    config::Config,
    database::{DatabaseHealthChecker, DatabaseManager, DatabaseManagerImpl},
    error::AppError,
    health::HealthService,
    jobs::{DependencyProbeJob, Job, JobScheduler, RateLimitPruneJob, TokenCleanupJob},
    keys::SigningKeys,
    rate_limit::{RateLimitService, rate_limit_middleware},
    revocation::{RevocationHealthChecker, RevocationStore, create_revocation_store},
    routes::{create_admin_routes, create_auth_routes, create_health_routes, create_key_routes},
    server::middleware::{panic_response, request_response_logger},
    shutdown::{ShutdownCoordinator, ShutdownManager},
    telegram::InitDataValidator,
    utils::request_id_middleware,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::RwLock};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// `/auth` bodies carry a single init data string; anything larger is refused.
const MAX_BODY_SIZE: usize = 16 * 1024;

#[derive(Clone)]
pub struct Server {
    pub config: Arc<Config>,
    pub health_service: Arc<HealthService>,
    pub database: Arc<dyn DatabaseManager>,
    pub revocation: Arc<dyn RevocationStore>,
    pub keys: Arc<SigningKeys>,
    pub login_service: Arc<LoginService>,
    pub rate_limiter: Arc<RateLimitService>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub shutdown_coordinator: Arc<ShutdownCoordinator>,
    pub job_scheduler: Arc<RwLock<JobScheduler>>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let metrics_handle = if config.metrics.enabled {
            Some(crate::metrics::init_metrics())
        } else {
            None
        };

        let keys = Arc::new(SigningKeys::load_or_generate(&config.keys)?);
        info!(kid = %keys.kid(), "Signing key loaded");

        let database: Arc<dyn DatabaseManager> =
            Arc::new(DatabaseManagerImpl::new_from_config(&config.database).await?);
        let revocation = create_revocation_store(&config.redis).await?;

        Ok(Self::from_components(config, database, revocation, keys, metrics_handle).await)
    }

    /// Wires the services around already constructed stores.
    pub async fn from_components(
        config: Config,
        database: Arc<dyn DatabaseManager>,
        revocation: Arc<dyn RevocationStore>,
        keys: Arc<SigningKeys>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        let health_service = Arc::new(HealthService::new());
        health_service
            .register(Arc::new(DatabaseHealthChecker::new(database.clone())))
            .await;
        health_service
            .register(Arc::new(RevocationHealthChecker::new(revocation.clone())))
            .await;
        health_service.register(keys.health_checker()).await;

        let tokens = TokenService::new(
            keys.clone(),
            config.keys.issuer.clone(),
            config.token_lifetime(),
        );
        let login_service = Arc::new(LoginService::new(
            InitDataValidator::from_config(&config.telegram),
            database.clone(),
            tokens,
            revocation.clone(),
        ));
        let rate_limiter = Arc::new(RateLimitService::from_config(&config.security));

        let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());
        let job_scheduler = Arc::new(RwLock::new(JobScheduler::with_shutdown_coordinator(
            true,
            shutdown_coordinator.subscribe(),
        )));

        Self {
            config: Arc::new(config),
            health_service,
            database,
            revocation,
            keys,
            login_service,
            rate_limiter,
            metrics_handle,
            shutdown_coordinator,
            job_scheduler,
        }
    }

    pub async fn run(&self) -> Result<(), AppError> {
        if self.config.database.migration_on_startup {
            self.database.migrate().await?;
        }

        self.job_scheduler
            .write()
            .await
            .start(self.background_jobs())
            .await;

        let shutdown_timeout = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
        let mut shutdown_manager = ShutdownManager::new(shutdown_timeout);
        shutdown_manager.register_server_components(self);

        let host = self.config.server.host.as_str();
        let public_listener = bind(host, self.config.server.port).await?;
        let internal_listener = bind(host, self.config.server.internal_port).await?;
        info!(
            "Public listener on http://{}, internal listener on http://{}",
            local_addr(&public_listener),
            local_addr(&internal_listener)
        );

        let coordinator = self.shutdown_coordinator.clone();
        let signal_task = tokio::spawn(async move {
            coordinator.wait_for_shutdown_signal().await;
        });
        shutdown_manager.register_background_task(signal_task, "signal_listener", 1);

        let public = self.serve(public_listener, self.create_public_app(), "public");
        let internal = self.serve(internal_listener, self.create_internal_app(), "internal");
        let servers = async { tokio::join!(public, internal) };

        // Once shutdown is requested, in-flight requests get the graceful window to drain.
        let coordinator = self.shutdown_coordinator.clone();
        let drain_deadline = async move {
            coordinator.wait_for_shutdown().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            _ = servers => {}
            _ = drain_deadline => {
                warn!(
                    "Connections did not drain within {}s, closing listeners",
                    shutdown_timeout.as_secs()
                );
            }
        }

        shutdown_manager.shutdown_all().await;
        info!("Server shutdown complete");
        Ok(())
    }

    async fn serve(&self, listener: TcpListener, app: Router, name: &'static str) {
        let coordinator = self.shutdown_coordinator.clone();
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            coordinator.wait_for_shutdown().await;
            info!("Graceful shutdown of {} listener initiated", name);
        })
        .into_future()
        .await;

        if let Err(e) = result {
            error!("{} listener error: {}", name, e);
        }
        // Losing one listener takes the whole process down.
        self.shutdown_coordinator.initiate_shutdown();
    }

    fn background_jobs(&self) -> Vec<Arc<dyn Job>> {
        let probe_period = Duration::from_secs(self.config.database.health_check_period_seconds.max(1));
        let mut jobs: Vec<Arc<dyn Job>> = vec![
            Arc::new(DependencyProbeJob::new(
                self.health_service.clone(),
                self.revocation.clone(),
                self.metrics_handle.clone(),
                probe_period,
            )),
            Arc::new(RateLimitPruneJob::new(self.rate_limiter.clone())),
        ];

        if self.config.cleanup.enabled {
            jobs.push(Arc::new(TokenCleanupJob::new(
                self.revocation.clone(),
                self.config.cleanup.interval(),
                self.config.cleanup.timeout(),
            )));
        } else {
            info!("Token cleanup job disabled");
        }
        jobs
    }

    /// `/auth`, health, key advertisement and metrics.
    pub fn create_public_app(&self) -> Router {
        let auth_routes = create_auth_routes()
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .route_layer(from_fn_with_state(
                self.rate_limiter.clone(),
                rate_limit_middleware,
            ));

        let app = Router::new()
            .merge(auth_routes)
            .merge(create_key_routes())
            .merge(create_health_routes())
            .with_state(self.clone());

        self.add_common_layers(app)
    }

    /// Admin endpoints plus health and metrics; bind to a private interface only.
    pub fn create_internal_app(&self) -> Router {
        let app = Router::new()
            .nest("/admin", create_admin_routes())
            .merge(create_health_routes())
            .with_state(self.clone());

        self.add_common_layers(app)
    }

    fn add_common_layers(&self, mut app: Router) -> Router {
        if self.config.metrics.enabled {
            app = app.layer(from_fn(crate::metrics::metrics_middleware));
        }
        if self.config.logging.log_request {
            app = app.layer(from_fn_with_state(
                self.config.clone(),
                request_response_logger,
            ));
        }
        app.layer(from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(panic_response))
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, AppError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| AppError::Internal(format!("Failed to bind to {host}:{port}: {e}")))
}

fn local_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}
