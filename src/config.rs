use crate::{
    auth::config::{KeysConfig, TelegramConfig},
    database::config::DatabaseConfig,
    revocation::config::RedisConfig,
    server::config::{CleanupConfig, LoggingConfig, MetricsConfig, SecurityConfig, ServerConfig},
    verifier::config::VerifierConfig,
};
use config::{
    Config as ConfigBuilder, ConfigError, Environment, File, FileFormat, FileSourceFile,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

const ENV_PREFIX: &str = "AUTH";
const MIN_LIFETIME_HOURS: i64 = 1;
const MAX_LIFETIME_HOURS: i64 = 168;
const MAX_OPERATION_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
}

impl Config {
    /// Defaults, then `./config.yaml` if present, then `AUTH_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(File::from(Path::new("config.yaml")).required(false))
    }

    /// Like [`Config::load`] but the file must exist.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::build(File::from(path.as_ref()).required(true))
    }

    fn build(file: File<FileSourceFile, FileFormat>) -> Result<Self, ConfigError> {
        let config: Config = ConfigBuilder::builder()
            .add_source(ConfigBuilder::try_from(&Config::default())?)
            .add_source(file)
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let lifetime = self.keys.lifetime_hours;
        if !(MIN_LIFETIME_HOURS..=MAX_LIFETIME_HOURS).contains(&lifetime) {
            return Err(invalid(format!(
                "keys.lifetime_hours must be between {MIN_LIFETIME_HOURS} and {MAX_LIFETIME_HOURS}, got {lifetime}"
            )));
        }
        if self.keys.issuer.trim().is_empty() {
            return Err(invalid("keys.issuer must not be empty".to_string()));
        }
        if !(1..=24).contains(&self.cleanup.interval_hours) {
            return Err(invalid(format!(
                "cleanup.interval_hours must be between 1 and 24, got {}",
                self.cleanup.interval_hours
            )));
        }
        if !(1..=60).contains(&self.cleanup.timeout_minutes) {
            return Err(invalid(format!(
                "cleanup.timeout_minutes must be between 1 and 60, got {}",
                self.cleanup.timeout_minutes
            )));
        }
        if self.telegram.bot_tokens().is_empty() {
            return Err(invalid(
                "telegram.bot_token must be set (AUTH_TELEGRAM__BOT_TOKEN)".to_string(),
            ));
        }
        if self.telegram.max_auth_age_seconds <= 0 {
            return Err(invalid(
                "telegram.max_auth_age_seconds must be positive".to_string(),
            ));
        }
        if self.security.rate_limit_requests == 0 || self.security.rate_limit_window_seconds == 0
        {
            return Err(invalid(
                "security.rate_limit_requests and security.rate_limit_window_seconds must be positive"
                    .to_string(),
            ));
        }
        if self.redis.max_connections == 0 {
            return Err(invalid("redis.max_connections must be at least 1".to_string()));
        }
        if self.redis.operation_timeout_ms == 0
            || self.redis.operation_timeout_ms > MAX_OPERATION_TIMEOUT_MS
        {
            return Err(invalid(format!(
                "redis.operation_timeout_ms must be between 1 and {MAX_OPERATION_TIMEOUT_MS}, got {}",
                self.redis.operation_timeout_ms
            )));
        }
        match self.redis.backend.as_str() {
            "redis" | "memory" => {}
            other => {
                return Err(invalid(format!(
                    "redis.backend must be `redis` or `memory`, got `{other}`"
                )));
            }
        }
        Ok(())
    }

    pub fn token_lifetime(&self) -> chrono::Duration {
        chrono::Duration::hours(self.keys.lifetime_hours)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("telegram.secondary_bot_tokens")
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Message(message)
}
