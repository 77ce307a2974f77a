pub mod keys;
pub mod maintenance;
pub mod migrate;

use crate::Config;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run user store migrations
    Migrate {
        #[command(subcommand)]
        action: migrate::MigrateAction,
    },
    /// Generate or inspect the token signing key pair
    Keys {
        #[command(subcommand)]
        action: keys::KeysAction,
    },
    /// Operator tasks against the revocation store
    Maintenance {
        #[command(subcommand)]
        task: maintenance::MaintenanceTask,
    },
}

pub async fn handle_command(
    command: Commands,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Migrate { action } => migrate::handle_migrate_command(action, config).await,
        Commands::Keys { action } => keys::handle_keys_command(action, config),
        Commands::Maintenance { task } => {
            maintenance::handle_maintenance_command(task, config).await
        }
    }
}
