use crate::Config;
use crate::database::migration::{Migrator, MigratorTrait};
use crate::database::{DatabaseManager, DatabaseManagerImpl};
use clap::Subcommand;
use sea_orm::DatabaseConnection;
use tracing::info;

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Run all pending migrations
    Up,
    /// Rollback the last migration
    Down {
        #[arg(
            short,
            long,
            help = "Number of migrations to rollback",
            default_value = "1"
        )]
        steps: u32,
    },
    /// Show applied and pending migrations
    Status,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MigrationStatus {
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}

pub async fn handle_migrate_command(
    action: MigrateAction,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let db_manager = DatabaseManagerImpl::new_from_config(&config.database).await?;
    let connection = db_manager.connection();

    match action {
        MigrateAction::Up => {
            info!("Running pending migrations...");
            Migrator::up(connection, None).await?;
            info!("All migrations completed successfully");
        }
        MigrateAction::Down { steps } => {
            info!("Rolling back {} migration(s)...", steps);
            Migrator::down(connection, Some(steps)).await?;
            info!("Rollback completed successfully");
        }
        MigrateAction::Status => {
            let status = migration_status(connection).await?;
            for name in &status.applied {
                println!("applied  {name}");
            }
            for name in &status.pending {
                println!("pending  {name}");
            }
        }
    }

    db_manager.close().await?;
    Ok(())
}

pub async fn migration_status(
    connection: &DatabaseConnection,
) -> Result<MigrationStatus, sea_orm::DbErr> {
    let applied = Migrator::get_applied_migrations(connection)
        .await?
        .iter()
        .map(|migration| migration.name().to_string())
        .collect();
    let pending = Migrator::get_pending_migrations(connection)
        .await?
        .iter()
        .map(|migration| migration.name().to_string())
        .collect();
    Ok(MigrationStatus { applied, pending })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;

    #[tokio::test]
    async fn test_status_tracks_up_and_down() {
        let manager = DatabaseManagerImpl::new_from_config(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        let connection = manager.connection();

        let status = migration_status(connection).await.unwrap();
        assert!(status.applied.is_empty());
        assert_eq!(status.pending, vec!["m20250101_000001_create_users_table"]);

        Migrator::up(connection, None).await.unwrap();
        let status = migration_status(connection).await.unwrap();
        assert_eq!(status.applied, vec!["m20250101_000001_create_users_table"]);
        assert!(status.pending.is_empty());

        Migrator::down(connection, Some(1)).await.unwrap();
        let status = migration_status(connection).await.unwrap();
        assert!(status.applied.is_empty());
    }
}
