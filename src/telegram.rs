//! Validation of the signed `initData` payload produced by the Telegram Web App.
//!
//! The payload is a url-encoded form. Every field except `hash` is sorted by key and joined
//! as `key=value` lines; the hash is HMAC-SHA256 of that string under a key derived from the
//! bot token (`HMAC-SHA256(key = "WebAppData", msg = bot_token)`).

use crate::auth::config::TelegramConfig;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const WEB_APP_DATA_KEY: &[u8] = b"WebAppData";
const HASH_FIELD: &str = "hash";
const AUTH_DATE_FIELD: &str = "auth_date";
const USER_FIELD: &str = "user";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelegramAuthError {
    #[error("malformed init data: {0}")]
    Malformed(String),
    #[error("init data has no hash")]
    MissingHash,
    #[error("init data has no auth_date")]
    MissingAuthDate,
    #[error("init data signature does not match any configured bot")]
    InvalidSignature,
    #[error("init data is {age_seconds}s old")]
    Stale { age_seconds: i64 },
    #[error("init data auth_date lies in the future")]
    FromFuture,
    #[error("init data has no usable user object")]
    MissingUser,
}

impl TelegramAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            TelegramAuthError::Stale { .. } | TelegramAuthError::FromFuture => "stale_auth_date",
            _ => "invalid_signature",
        }
    }
}

/// The `user` object embedded in `initData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInitData {
    pub user: TelegramUser,
    pub auth_date: DateTime<Utc>,
    pub query_id: Option<String>,
    /// Position of the matching bot in the configured token list.
    pub bot_index: usize,
}

/// Derived signing key for one bot.
pub fn derive_signing_key(bot_token: &str) -> [u8; 32] {
    hmac_sha256(WEB_APP_DATA_KEY, bot_token.as_bytes())
}

/// Joins the fields as sorted `key=value` lines.
pub fn data_check_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn compute_hash(signing_key: &[u8; 32], data_check_string: &str) -> [u8; 32] {
    hmac_sha256(signing_key, data_check_string.as_bytes())
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Builds a url-encoded `initData` string signed for `bot_token`.
///
/// Mirrors what the Telegram client produces; used by tooling and tests.
pub fn sign_init_data(bot_token: &str, fields: &[(&str, &str)]) -> String {
    let sorted: BTreeMap<String, String> = fields
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    let hash = compute_hash(&derive_signing_key(bot_token), &data_check_string(&sorted));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in fields {
        serializer.append_pair(key, value);
    }
    serializer.append_pair(HASH_FIELD, &hex::encode(hash));
    serializer.finish()
}

pub struct InitDataValidator {
    signing_keys: Vec<[u8; 32]>,
    max_age_seconds: i64,
}

impl std::fmt::Debug for InitDataValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitDataValidator")
            .field("bots", &self.signing_keys.len())
            .field("max_age_seconds", &self.max_age_seconds)
            .finish()
    }
}

impl InitDataValidator {
    pub fn new<I, S>(bot_tokens: I, max_age_seconds: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let signing_keys = bot_tokens
            .into_iter()
            .map(|token| derive_signing_key(token.as_ref()))
            .collect();
        Self {
            signing_keys,
            max_age_seconds,
        }
    }

    pub fn from_config(config: &TelegramConfig) -> Self {
        Self::new(config.bot_tokens(), config.max_auth_age_seconds)
    }

    pub fn bot_count(&self) -> usize {
        self.signing_keys.len()
    }

    pub fn validate(&self, init_data: &str) -> Result<ValidatedInitData, TelegramAuthError> {
        self.validate_at(init_data, Utc::now())
    }

    pub fn validate_at(
        &self,
        init_data: &str,
        now: DateTime<Utc>,
    ) -> Result<ValidatedInitData, TelegramAuthError> {
        let mut fields = parse_fields(init_data)?;
        let received_hash = fields
            .remove(HASH_FIELD)
            .ok_or(TelegramAuthError::MissingHash)?;

        let bot_index = self.match_signature(&fields, &received_hash)?;

        let auth_date = parse_auth_date(&fields)?;
        let age_seconds = now.timestamp() - auth_date.timestamp();
        if age_seconds < 0 {
            return Err(TelegramAuthError::FromFuture);
        }
        if age_seconds > self.max_age_seconds {
            return Err(TelegramAuthError::Stale { age_seconds });
        }

        let user = fields
            .get(USER_FIELD)
            .ok_or(TelegramAuthError::MissingUser)
            .and_then(|raw| {
                serde_json::from_str::<TelegramUser>(raw)
                    .map_err(|_| TelegramAuthError::MissingUser)
            })?;

        Ok(ValidatedInitData {
            user,
            auth_date,
            query_id: fields.get("query_id").cloned(),
            bot_index,
        })
    }

    /// Every configured key is tried so timing does not reveal which bot matched.
    fn match_signature(
        &self,
        fields: &BTreeMap<String, String>,
        received_hash: &str,
    ) -> Result<usize, TelegramAuthError> {
        let expected = hex::decode(received_hash).map_err(|_| TelegramAuthError::InvalidSignature)?;
        let check_string = data_check_string(fields);

        let mut matched = None;
        for (index, key) in self.signing_keys.iter().enumerate() {
            let computed = compute_hash(key, &check_string);
            let equal: bool = computed.as_slice().ct_eq(expected.as_slice()).into();
            if equal && matched.is_none() {
                matched = Some(index);
            }
        }
        matched.ok_or(TelegramAuthError::InvalidSignature)
    }
}

fn parse_fields(init_data: &str) -> Result<BTreeMap<String, String>, TelegramAuthError> {
    let trimmed = init_data.trim();
    if trimmed.is_empty() {
        return Err(TelegramAuthError::Malformed("empty payload".to_string()));
    }

    let mut fields = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(trimmed.as_bytes()) {
        if key.is_empty() {
            return Err(TelegramAuthError::Malformed("empty field name".to_string()));
        }
        if fields.insert(key.to_string(), value.into_owned()).is_some() {
            return Err(TelegramAuthError::Malformed(format!("duplicate field `{key}`")));
        }
    }
    Ok(fields)
}

fn parse_auth_date(fields: &BTreeMap<String, String>) -> Result<DateTime<Utc>, TelegramAuthError> {
    let raw = fields
        .get(AUTH_DATE_FIELD)
        .ok_or(TelegramAuthError::MissingAuthDate)?;
    let seconds: i64 = raw
        .parse()
        .map_err(|_| TelegramAuthError::Malformed("auth_date is not an integer".to_string()))?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| TelegramAuthError::Malformed("auth_date out of range".to_string()))
}
