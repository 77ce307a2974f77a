//! Fixtures shared by unit tests: fixed RSA keys, signed init data and an in-memory server.

use crate::{
    config::Config,
    database::{DatabaseManager, DatabaseManagerImpl, test_support::memory_database},
    keys::SigningKeys,
    revocation::{MemoryRevocationStore, RevocationStore},
    server::Server,
    telegram::sign_init_data,
};
use std::sync::Arc;

pub const TEST_PRIVATE_KEY_PEM: &str = include_str!("../tests/fixtures/test_private_key.pem");
pub const OTHER_PRIVATE_KEY_PEM: &str = include_str!("../tests/fixtures/other_private_key.pem");
pub const TEST_BOT_TOKEN: &str = "12345:test-bot-token";

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.telegram.bot_token = TEST_BOT_TOKEN.to_string();
    config.redis = crate::revocation::RedisConfig::memory();
    config.database.url = "sqlite::memory:".to_string();
    config.metrics.enabled = false;
    config.logging.log_request = false;
    config
}

/// A current init data payload for `telegram_id` signed with [`TEST_BOT_TOKEN`].
pub fn init_data_for(telegram_id: i64, first_name: &str, auth_date: i64) -> String {
    let user = serde_json::json!({
        "id": telegram_id,
        "first_name": first_name,
        "language_code": "en",
    })
    .to_string();
    let auth_date = auth_date.to_string();
    sign_init_data(
        TEST_BOT_TOKEN,
        &[("auth_date", auth_date.as_str()), ("user", user.as_str())],
    )
}

/// Test server builder over SQLite in memory and the memory revocation store
pub struct TestServerBuilder {
    config: Config,
    revocation: Option<Arc<dyn RevocationStore>>,
}

impl TestServerBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            revocation: None,
        }
    }

    pub fn with_config(mut self, update: impl FnOnce(&mut Config)) -> Self {
        update(&mut self.config);
        self
    }

    pub fn with_revocation_store(mut self, store: Arc<dyn RevocationStore>) -> Self {
        self.revocation = Some(store);
        self
    }

    pub async fn build(self) -> Server {
        let keys = Arc::new(SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap());
        let database: Arc<dyn DatabaseManager> =
            Arc::new(DatabaseManagerImpl::from_connection(memory_database().await));
        let revocation = self
            .revocation
            .unwrap_or_else(|| Arc::new(MemoryRevocationStore::new()));

        Server::from_components(self.config, database, revocation, keys, None).await
    }
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
