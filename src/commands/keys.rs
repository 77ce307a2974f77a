use crate::Config;
use crate::keys::{KeyError, SigningKeys};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum KeysAction {
    /// Generate a fresh RSA-2048 key pair at the configured paths
    Generate {
        #[arg(long, help = "Overwrite an existing private key")]
        force: bool,
    },
    /// Print the public key as PEM and JWKS
    Show,
}

pub fn handle_keys_command(
    action: KeysAction,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        KeysAction::Generate { force } => {
            let keys = generate_keys(config, force)?;
            println!("Generated key pair with kid {}", keys.kid());
            println!("private key: {}", config.keys.private_key_path);
            println!("public key:  {}", config.keys.public_key_path);
        }
        KeysAction::Show => {
            let keys = SigningKeys::load_or_generate(&config.keys)?;
            println!("{}", keys.public_key_pem().trim_end());
            println!("{}", serde_json::to_string_pretty(keys.jwks())?);
        }
    }
    Ok(())
}

pub fn generate_keys(config: &Config, force: bool) -> Result<SigningKeys, KeyError> {
    SigningKeys::generate_and_persist(
        Path::new(&config.keys.private_key_path),
        Path::new(&config.keys.public_key_path),
        force,
    )
}
