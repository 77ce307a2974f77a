//! User store: sea-orm entities, migrations and the users DAO.

use std::sync::Arc;
use std::time::Duration;

use crate::health::{HealthCheckResult, HealthChecker};
use async_trait::async_trait;
use sea_orm::{ConnectOptions, ConnectionTrait, DatabaseConnection, DbErr, SqlErr};
use thiserror::Error;
use tracing::info;

pub mod config;
pub mod dao;
pub mod entities;
pub mod migration;

pub use self::config::DatabaseConfig;
pub use dao::{UpsertOutcome, UserProfile, UsersDao};

/// Database error types
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Record not found")]
    NotFound,
    #[error("Constraint violation: {0}")]
    Constraint(String),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Telegram id already registered by a concurrent insert")]
    DuplicateTelegramId,
    #[error("Database unavailable: {0}")]
    Unavailable(String),
    /// Lock contention between concurrent writers (SQLite `BUSY` / `LOCKED`).
    #[error("Database busy: {0}")]
    Busy(String),
}

impl DatabaseError {
    /// Errors worth one more attempt from the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Unavailable(_) | DatabaseError::Busy(_))
    }
}

/// SQLite reports writer contention as result codes 5 (`BUSY`) and 6 (`LOCKED`), which
/// sea-orm only surfaces through the error text.
fn is_lock_contention(message: &str) -> bool {
    ["(code: 5)", "(code: 6)", "database is locked", "table is locked", "database is deadlocked"]
        .iter()
        .any(|needle| message.contains(needle))
}

impl From<DbErr> for DatabaseError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(message)) if message.contains("telegram_id") => {
                return DatabaseError::DuplicateTelegramId;
            }
            Some(SqlErr::UniqueConstraintViolation(message))
            | Some(SqlErr::ForeignKeyConstraintViolation(message)) => {
                return DatabaseError::Constraint(message);
            }
            _ => {}
        }

        match err {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => {
                DatabaseError::Unavailable(err.to_string())
            }
            DbErr::RecordNotFound(_) | DbErr::RecordNotUpdated => DatabaseError::NotFound,
            other => {
                let message = other.to_string();
                if is_lock_contention(&message) {
                    DatabaseError::Busy(message)
                } else {
                    DatabaseError::Database(message)
                }
            }
        }
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database manager trait for dependency injection and testing
#[async_trait]
pub trait DatabaseManager: Send + Sync {
    /// Run pending migrations
    async fn migrate(&self) -> DatabaseResult<()>;

    /// Ping the database
    async fn health_check(&self) -> DatabaseResult<()>;

    fn users(&self) -> UsersDao;

    /// Direct connection for migrations and admin operations
    fn connection(&self) -> &DatabaseConnection;

    /// Close the pool; in-flight queries finish first.
    async fn close(&self) -> DatabaseResult<()>;
}

/// Database connection manager implementation
pub struct DatabaseManagerImpl {
    pub connection: DatabaseConnection,
}

impl DatabaseManagerImpl {
    /// Connect using the pool settings from configuration
    pub async fn new_from_config(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut options = ConnectOptions::new(config.url.clone());
        options
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(config.max_lifetime_seconds))
            .sqlx_logging(false);

        let connection = sea_orm::Database::connect(options)
            .await
            .map_err(|e| DatabaseError::Unavailable(e.to_string()))?;

        info!(
            url = %crate::revocation::redact_url(&config.url),
            max_connections = config.max_connections,
            "Connected to user store"
        );
        Ok(Self { connection })
    }

    pub fn from_connection(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl DatabaseManager for DatabaseManagerImpl {
    async fn migrate(&self) -> DatabaseResult<()> {
        use crate::database::migration::{Migrator, MigratorTrait};

        info!("Running database migrations");

        Migrator::up(&self.connection, None)
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to run migrations: {}", e)))?;

        info!("Successfully completed all migrations");
        Ok(())
    }

    async fn health_check(&self) -> DatabaseResult<()> {
        self.connection
            .ping()
            .await
            .map_err(|e| DatabaseError::Unavailable(e.to_string()))
    }

    fn users(&self) -> UsersDao {
        UsersDao::new(self.connection.clone())
    }

    fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.connection
            .clone()
            .close()
            .await
            .map_err(DatabaseError::from)
    }
}

/// Reports the user store under the `postgres` dependency name.
pub struct DatabaseHealthChecker {
    database: Arc<dyn DatabaseManager>,
}

impl DatabaseHealthChecker {
    pub fn new(database: Arc<dyn DatabaseManager>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl HealthChecker for DatabaseHealthChecker {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.database.health_check().await {
            Ok(_) => HealthCheckResult::healthy_with_details(serde_json::json!({
                "connection": "ok",
                "backend": format!("{:?}", self.database.connection().get_database_backend()),
            })),
            Err(err) => HealthCheckResult::unhealthy_with_details(
                "DB health check failed".to_string(),
                serde_json::json!({ "error": err.to_string() }),
            ),
        }
    }
}
