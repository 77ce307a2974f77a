//! The `/auth` login pipeline: validate init data, upsert the user, mint and register a token.

use crate::auth::jwt::{TOKEN_TYPE, TokenService};
use crate::database::{DatabaseError, DatabaseManager, UpsertOutcome, UserProfile};
use crate::error::AppError;
use crate::revocation::RevocationStore;
use crate::telegram::{InitDataValidator, TelegramUser};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub telegram_id: i64,
    pub is_new_user: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub language_code: Option<String>,
    pub photo_url: Option<String>,
    pub is_premium: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: UserSummary,
}

impl From<&TelegramUser> for UserProfile {
    fn from(user: &TelegramUser) -> Self {
        Self {
            telegram_id: user.id,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            language_code: user.language_code.clone(),
            photo_url: user.photo_url.clone(),
            is_premium: user.is_premium,
        }
    }
}

pub struct LoginService {
    validator: InitDataValidator,
    database: Arc<dyn DatabaseManager>,
    tokens: TokenService,
    revocation: Arc<dyn RevocationStore>,
}

impl LoginService {
    pub fn new(
        validator: InitDataValidator,
        database: Arc<dyn DatabaseManager>,
        tokens: TokenService,
        revocation: Arc<dyn RevocationStore>,
    ) -> Self {
        Self {
            validator,
            database,
            tokens,
            revocation,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub async fn login(&self, init_data: &str) -> Result<LoginResponse, AppError> {
        let result = self.login_inner(init_data).await;
        crate::metrics::track_auth_attempt(match &result {
            Ok(_) => "success",
            Err(err) => err.code(),
        });
        result
    }

    async fn login_inner(&self, init_data: &str) -> Result<LoginResponse, AppError> {
        let validated = self.validator.validate(init_data)?;
        let profile = UserProfile::from(&validated.user);

        let UpsertOutcome { user, is_new } = self.upsert_with_retry(&profile).await?;
        if !user.is_active {
            info!(user_id = %user.id, telegram_id = user.telegram_id, "Login refused for deactivated user");
            return Err(AppError::UserInactive);
        }

        let issued = self.tokens.mint(user.id, user.telegram_id)?;
        let user_id = user.id.to_string();
        if let Err(err) = self
            .revocation
            .register_token(&issued.claims.jti, &user_id, issued.claims.expires_at())
            .await
        {
            error!(
                user_id = %user_id,
                token_id = %issued.claims.jti,
                error = %err,
                "Token registration failed after user upsert"
            );
            return Err(err.into());
        }

        crate::metrics::track_token_issued();
        info!(
            user_id = %user_id,
            telegram_id = user.telegram_id,
            token_id = %issued.claims.jti,
            is_new_user = is_new,
            bot_index = validated.bot_index,
            "Issued access token"
        );

        Ok(LoginResponse {
            access_token: issued.token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: issued.expires_in,
            user: UserSummary {
                id: user.id,
                telegram_id: user.telegram_id,
                is_new_user: is_new,
                first_name: user.first_name,
                last_name: user.last_name,
                username: user.username,
                language_code: user.language_code,
                photo_url: user.photo_url,
                is_premium: user.is_premium,
            },
        })
    }

    /// One extra attempt when the user store reports a transient failure.
    async fn upsert_with_retry(&self, profile: &UserProfile) -> Result<UpsertOutcome, DatabaseError> {
        let users = self.database.users();
        match users.upsert(profile).await {
            Err(err) if err.is_transient() => {
                warn!(telegram_id = profile.telegram_id, error = %err, "User upsert failed, retrying once");
                users.upsert(profile).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManagerImpl;
    use crate::database::test_support::memory_database;
    use crate::keys::SigningKeys;
    use crate::revocation::MemoryRevocationStore;
    use crate::telegram::sign_init_data;
    use crate::test_utils::TEST_PRIVATE_KEY_PEM;
    use chrono::{Duration, Utc};

    const BOT_TOKEN: &str = "12345:test-bot-token";

    async fn login_service() -> (LoginService, Arc<MemoryRevocationStore>, Arc<DatabaseManagerImpl>) {
        let keys = Arc::new(SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap());
        let database = Arc::new(DatabaseManagerImpl::from_connection(memory_database().await));
        let store = Arc::new(MemoryRevocationStore::new());
        let service = LoginService::new(
            InitDataValidator::new([BOT_TOKEN], 86400),
            database.clone(),
            TokenService::new(keys, "game-auth", Duration::hours(24)),
            store.clone(),
        );
        (service, store, database)
    }

    fn init_data(auth_date: i64) -> String {
        let auth_date = auth_date.to_string();
        sign_init_data(
            BOT_TOKEN,
            &[
                ("auth_date", auth_date.as_str()),
                ("query_id", "AAHdF6IQAAAAAN0XohDhrOrc"),
                (
                    "user",
                    r#"{"id":56851083,"first_name":"Alice","username":"alice","language_code":"en"}"#,
                ),
            ],
        )
    }

    #[tokio::test]
    async fn test_login_creates_user_and_registers_token() {
        let (service, store, _) = login_service().await;

        let response = service.login(&init_data(Utc::now().timestamp())).await.unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, 86400);
        assert!(response.user.is_new_user);
        assert_eq!(response.user.telegram_id, 56851083);
        assert_eq!(response.user.first_name.as_deref(), Some("Alice"));

        let claims = service.tokens().decode(&response.access_token).unwrap();
        assert_eq!(claims.sub, response.user.id.to_string());

        let live = store.list_user_tokens(&claims.sub).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].token_id, claims.jti);
    }

    #[tokio::test]
    async fn test_second_login_reuses_user() {
        let (service, _, _) = login_service().await;
        let now = Utc::now().timestamp();

        let first = service.login(&init_data(now)).await.unwrap();
        let second = service.login(&init_data(now)).await.unwrap();

        assert!(first.user.is_new_user);
        assert!(!second.user.is_new_user);
        assert_eq!(first.user.id, second.user.id);
        assert_ne!(first.access_token, second.access_token);
    }

    #[tokio::test]
    async fn test_stale_payload_rejected() {
        let (service, _, database) = login_service().await;
        let stale = Utc::now().timestamp() - 25 * 3600;

        let err = service.login(&init_data(stale)).await.unwrap_err();
        assert_eq!(err.code(), "stale_auth_date");
        assert_eq!(database.users().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deactivated_user_gets_no_token() {
        let (service, store, database) = login_service().await;
        let first = service.login(&init_data(Utc::now().timestamp())).await.unwrap();
        database.users().set_active(first.user.id, false).await.unwrap();

        let err = service
            .login(&init_data(Utc::now().timestamp()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UserInactive));

        let live = store
            .list_user_tokens(&first.user.id.to_string())
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
    }
}
