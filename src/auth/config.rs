use serde::{Deserialize, Serialize};

/// `iss` claim used when none is configured; verifiers expect it by default.
pub const DEFAULT_ISSUER: &str = "game-auth";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_private_key_path")]
    pub private_key_path: String,
    #[serde(default = "default_public_key_path")]
    pub public_key_path: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_lifetime_hours")]
    pub lifetime_hours: i64,
}

fn default_private_key_path() -> String {
    "./keys/private.pem".to_string()
}

fn default_public_key_path() -> String {
    "./keys/public.pem".to_string()
}

fn default_issuer() -> String {
    DEFAULT_ISSUER.to_string()
}

fn default_lifetime_hours() -> i64 {
    24
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            private_key_path: default_private_key_path(),
            public_key_path: default_public_key_path(),
            issuer: default_issuer(),
            lifetime_hours: default_lifetime_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Extra bots served by the same installation.
    #[serde(default)]
    pub secondary_bot_tokens: Vec<String>,
    #[serde(default = "default_max_auth_age_seconds")]
    pub max_auth_age_seconds: i64,
}

fn default_max_auth_age_seconds() -> i64 {
    86400 // 24 hours
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            secondary_bot_tokens: Vec::new(),
            max_auth_age_seconds: default_max_auth_age_seconds(),
        }
    }
}

impl TelegramConfig {
    /// Primary token first, then the secondaries; blanks are skipped.
    pub fn bot_tokens(&self) -> Vec<String> {
        std::iter::once(&self.bot_token)
            .chain(self.secondary_bot_tokens.iter())
            .map(|token| token.trim())
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect()
    }
}
