use crate::{
    Config,
    jobs::run_cleanup,
    revocation::{RevocationStore, create_revocation_store, revoke_token, revoke_user_tokens},
};
use clap::Subcommand;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Subcommand)]
pub enum MaintenanceTask {
    /// Sweep expired entries from the per-user token indices once
    Cleanup,
    /// Revoke every live token of a user
    RevokeUser {
        #[arg(help = "Internal user id (UUID)")]
        user_id: Uuid,
    },
    /// Revoke a single token by its id (jti)
    RevokeToken {
        #[arg(help = "Token id")]
        token_id: String,
    },
}

pub async fn handle_maintenance_command(
    task: MaintenanceTask,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.redis.backend == "memory" {
        warn!("Revocation backend is `memory`; maintenance tasks only see this process");
    }
    let store = create_revocation_store(&config.redis).await?;
    let summary = run_task(task, store.as_ref(), config).await?;
    println!("{summary}");
    Ok(())
}

/// Runs one task and returns the line printed for the operator.
pub async fn run_task(
    task: MaintenanceTask,
    store: &dyn RevocationStore,
    config: &Config,
) -> Result<String, Box<dyn std::error::Error>> {
    match task {
        MaintenanceTask::Cleanup => {
            info!("Running token index cleanup...");
            let report = run_cleanup(store, config.cleanup.timeout()).await?;
            Ok(format!(
                "expired_count={} users_seen={}",
                report.expired_count, report.users_seen
            ))
        }
        MaintenanceTask::RevokeUser { user_id } => {
            let count = revoke_user_tokens(store, &user_id.to_string()).await?;
            Ok(format!("user_id={user_id} revoked={count}"))
        }
        MaintenanceTask::RevokeToken { token_id } => {
            let revoked = revoke_token(store, &token_id).await?;
            Ok(format!("token_id={token_id} revoked={revoked}"))
        }
    }
}
