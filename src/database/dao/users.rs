use crate::database::entities::{UserRecord, users};
use crate::database::{DatabaseError, DatabaseResult};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Update attempts after losing an insert race on the same telegram id.
const MAX_UPSERT_RETRIES: u32 = 3;
/// Total time spent waiting out lock contention before giving up.
const MAX_BUSY_WAIT: Duration = Duration::from_secs(2);

/// Profile fields taken from a validated Telegram payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub photo_url: Option<String>,
    pub is_premium: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub user: UserRecord,
    pub is_new: bool,
}

/// Users DAO for database operations
#[derive(Clone)]
pub struct UsersDao {
    db: DatabaseConnection,
}

impl UsersDao {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts a new user or refreshes the profile and login time of an existing one.
    ///
    /// Two concurrent first logins for the same telegram id race on the unique index; the
    /// loser retries and takes the update path. Lock contention is retried with jittered
    /// backoff.
    pub async fn upsert(&self, profile: &UserProfile) -> DatabaseResult<UpsertOutcome> {
        let start = Instant::now();
        let mut attempt = 0;
        let mut busy_backoff = busy_backoff();
        let result = loop {
            match self.upsert_once(profile).await {
                Err(DatabaseError::DuplicateTelegramId) if attempt < MAX_UPSERT_RETRIES => {
                    attempt += 1;
                    debug!(
                        telegram_id = profile.telegram_id,
                        attempt, "Lost user insert race, retrying update path"
                    );
                }
                Err(DatabaseError::Busy(reason)) => match busy_backoff.next_backoff() {
                    Some(delay) => {
                        debug!(
                            telegram_id = profile.telegram_id,
                            delay_ms = delay.as_millis() as u64,
                            "User store busy, retrying upsert"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(DatabaseError::Busy(reason)),
                },
                other => break other,
            }
        };
        crate::metrics::track_user_store_operation("upsert", result.is_ok(), start.elapsed());
        result
    }

    async fn upsert_once(&self, profile: &UserProfile) -> DatabaseResult<UpsertOutcome> {
        let txn = self.db.begin().await?;
        let existing = users::Entity::find()
            .filter(users::Column::TelegramId.eq(profile.telegram_id))
            .one(&txn)
            .await?;

        let outcome = match existing {
            Some(user) => UpsertOutcome {
                user: Self::refresh_profile(&txn, user, profile).await?,
                is_new: false,
            },
            None => UpsertOutcome {
                user: Self::insert_user(&txn, profile).await?,
                is_new: true,
            },
        };

        txn.commit().await?;
        Ok(outcome)
    }

    async fn refresh_profile(
        txn: &DatabaseTransaction,
        user: UserRecord,
        profile: &UserProfile,
    ) -> DatabaseResult<UserRecord> {
        let now = Utc::now();
        let mut active_model: users::ActiveModel = user.into();
        active_model.username = Set(profile.username.clone());
        active_model.first_name = Set(profile.first_name.clone());
        active_model.last_name = Set(profile.last_name.clone());
        active_model.language_code = Set(profile.language_code.clone());
        active_model.photo_url = Set(profile.photo_url.clone());
        active_model.is_premium = Set(profile.is_premium);
        active_model.updated_at = Set(now);
        active_model.last_login = Set(now);

        Ok(active_model.update(txn).await?)
    }

    async fn insert_user(
        txn: &DatabaseTransaction,
        profile: &UserProfile,
    ) -> DatabaseResult<UserRecord> {
        let now = Utc::now();
        let active_model = users::ActiveModel {
            id: Set(Uuid::new_v4()),
            telegram_id: Set(profile.telegram_id),
            username: Set(profile.username.clone()),
            first_name: Set(profile.first_name.clone()),
            last_name: Set(profile.last_name.clone()),
            language_code: Set(profile.language_code.clone()),
            photo_url: Set(profile.photo_url.clone()),
            is_premium: Set(profile.is_premium),
            created_at: Set(now),
            updated_at: Set(now),
            last_login: Set(now),
            is_active: Set(true),
        };

        Ok(active_model.insert(txn).await?)
    }

    /// Find user by internal ID
    pub async fn find_by_id(&self, user_id: Uuid) -> DatabaseResult<Option<UserRecord>> {
        let start = Instant::now();
        let result = users::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(DatabaseError::from);
        crate::metrics::track_user_store_operation("find_by_id", result.is_ok(), start.elapsed());
        result
    }

    /// Find user by Telegram user ID
    pub async fn find_by_telegram_id(&self, telegram_id: i64) -> DatabaseResult<Option<UserRecord>> {
        let start = Instant::now();
        let result = users::Entity::find()
            .filter(users::Column::TelegramId.eq(telegram_id))
            .one(&self.db)
            .await
            .map_err(DatabaseError::from);
        crate::metrics::track_user_store_operation(
            "find_by_telegram_id",
            result.is_ok(),
            start.elapsed(),
        );
        result
    }

    /// Toggle the soft-deactivation flag
    pub async fn set_active(&self, user_id: Uuid, active: bool) -> DatabaseResult<UserRecord> {
        let start = Instant::now();
        let active_model = users::ActiveModel {
            id: Set(user_id),
            is_active: Set(active),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };

        let result = active_model
            .update(&self.db)
            .await
            .map_err(DatabaseError::from);
        crate::metrics::track_user_store_operation("set_active", result.is_ok(), start.elapsed());
        result
    }

    /// Count all users
    pub async fn count(&self) -> DatabaseResult<u64> {
        Ok(users::Entity::find().count(&self.db).await?)
    }

    /// Count users allowed to log in
    pub async fn count_active(&self) -> DatabaseResult<u64> {
        Ok(users::Entity::find()
            .filter(users::Column::IsActive.eq(true))
            .count(&self.db)
            .await?)
    }
}

fn busy_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(5),
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(100),
        multiplier: 2.0,
        max_elapsed_time: Some(MAX_BUSY_WAIT),
        ..Default::default()
    }
}
