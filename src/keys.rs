//! The issuer's RSA signing key pair and its public advertisements (PEM and JWKS).

use crate::auth::config::KeysConfig;
use crate::health::{HealthCheckResult, HealthChecker};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const KEY_BITS: usize = 2048;
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::RS256;
const KID_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to access key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("RSA key must be at least {KEY_BITS} bits, got {0}")]
    KeyTooSmall(usize),
    #[error("failed to encode key: {0}")]
    Encoding(String),
    #[error("failed to generate key pair: {0}")]
    Generation(String),
    #[error("refusing to overwrite existing key at {0}")]
    AlreadyExists(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

/// Key pair loaded at startup; read-only afterwards.
pub struct SigningKeys {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key_pem: String,
    jwks: Jwks,
    kid: String,
}

impl std::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeys")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl SigningKeys {
    /// Loads the private key from disk, generating and persisting a new pair when absent.
    pub fn load_or_generate(config: &KeysConfig) -> Result<Self, KeyError> {
        let private_path = Path::new(&config.private_key_path);
        let public_path = Path::new(&config.public_key_path);

        if !private_path.exists() {
            warn!(
                path = %private_path.display(),
                "No private key found, generating a fresh RSA-{} key pair",
                KEY_BITS
            );
            return Self::generate_and_persist(private_path, public_path, false);
        }

        let pem = read_file(private_path)?;
        let keys = Self::from_private_pem(&pem)?;

        let stored_public = if public_path.exists() {
            Some(read_file(public_path)?)
        } else {
            None
        };
        match stored_public {
            Some(existing) if existing.trim() == keys.public_key_pem.trim() => {}
            Some(_) => {
                warn!(
                    path = %public_path.display(),
                    "Public key file does not match the private key, rewriting it"
                );
                write_file(public_path, &keys.public_key_pem, false)?;
            }
            None => {
                info!(path = %public_path.display(), "Public key file missing, deriving it from the private key");
                write_file(public_path, &keys.public_key_pem, false)?;
            }
        }

        info!(kid = %keys.kid, "Loaded signing key");
        Ok(keys)
    }

    /// Generates a new pair and writes both halves. Without `overwrite`, an existing
    /// private key is left untouched and an error is returned.
    pub fn generate_and_persist(
        private_path: &Path,
        public_path: &Path,
        overwrite: bool,
    ) -> Result<Self, KeyError> {
        if !overwrite && private_path.exists() {
            return Err(KeyError::AlreadyExists(private_path.to_path_buf()));
        }

        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;

        let keys = Self::from_private_key(&private_key, private_pem.as_bytes())?;
        write_file(private_path, &private_pem, true)?;
        write_file(public_path, &keys.public_key_pem, false)?;

        info!(
            kid = %keys.kid,
            private_key = %private_path.display(),
            public_key = %public_path.display(),
            "Generated and persisted a new signing key pair"
        );
        Ok(keys)
    }

    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM.
    pub fn from_private_pem(pem: &str) -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))?;
        Self::from_private_key(&private_key, pem.as_bytes())
    }

    fn from_private_key(private_key: &RsaPrivateKey, private_pem: &[u8]) -> Result<Self, KeyError> {
        let bits = private_key.size() * 8;
        if bits < KEY_BITS {
            return Err(KeyError::KeyTooSmall(bits));
        }

        let public_key = private_key.to_public_key();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        let kid = key_id(&public_key)?;

        let encoding_key = EncodingKey::from_rsa_pem(private_pem)
            .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| KeyError::Encoding(e.to_string()))?;

        let jwks = Jwks {
            keys: vec![Jwk {
                kty: "RSA".to_string(),
                alg: "RS256".to_string(),
                use_: "sig".to_string(),
                kid: kid.clone(),
                n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
                e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
            }],
        };

        Ok(Self {
            encoding_key,
            decoding_key,
            public_key_pem,
            jwks,
            kid,
        })
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn jwks(&self) -> &Jwks {
        &self.jwks
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn health_checker(self: &Arc<Self>) -> Arc<KeysHealthChecker> {
        Arc::new(KeysHealthChecker { keys: self.clone() })
    }
}

/// First 16 characters of base64url(SHA-256(SubjectPublicKeyInfo DER)).
pub fn key_id(public_key: &RsaPublicKey) -> Result<String, KeyError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
    let digest = Sha256::digest(der.as_bytes());
    let mut kid = URL_SAFE_NO_PAD.encode(digest);
    kid.truncate(KID_LENGTH);
    Ok(kid)
}

fn read_file(path: &Path) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &str, private: bool) -> Result<(), KeyError> {
    let io_err = |source: std::io::Error| KeyError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io_err)?;

    // `mode` only applies on creation; tighten a pre-existing file before any bytes land.
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
    }
    #[cfg(not(unix))]
    let _ = private;

    file.write_all(contents.as_bytes()).map_err(io_err)?;
    Ok(())
}

/// Signs and verifies a probe message with the loaded pair.
pub struct KeysHealthChecker {
    keys: Arc<SigningKeys>,
}

const PROBE_MESSAGE: &[u8] = b"game-auth key probe";

#[async_trait]
impl HealthChecker for KeysHealthChecker {
    fn name(&self) -> &str {
        "keys"
    }

    async fn check(&self) -> HealthCheckResult {
        let signature =
            match jsonwebtoken::crypto::sign(PROBE_MESSAGE, &self.keys.encoding_key, SIGNING_ALGORITHM)
            {
                Ok(signature) => signature,
                Err(err) => {
                    return HealthCheckResult::unhealthy_with_details(
                        "Failed to sign probe message".to_string(),
                        serde_json::json!({ "kid": self.keys.kid, "error": err.to_string() }),
                    );
                }
            };

        match jsonwebtoken::crypto::verify(
            &signature,
            PROBE_MESSAGE,
            &self.keys.decoding_key,
            SIGNING_ALGORITHM,
        ) {
            Ok(true) => HealthCheckResult::healthy_with_details(serde_json::json!({
                "kid": self.keys.kid,
                "algorithm": "RS256",
            })),
            Ok(false) => HealthCheckResult::unhealthy_with_details(
                "Public key does not verify the private key signature".to_string(),
                serde_json::json!({ "kid": self.keys.kid }),
            ),
            Err(err) => HealthCheckResult::unhealthy_with_details(
                "Failed to verify probe signature".to_string(),
                serde_json::json!({ "kid": self.keys.kid, "error": err.to_string() }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{OTHER_PRIVATE_KEY_PEM, TEST_PRIVATE_KEY_PEM};
    use tempfile::TempDir;

    #[test]
    fn test_from_private_pem() {
        let keys = SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap();
        assert!(keys.public_key_pem().starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(keys.kid().len(), 16);

        let jwk = &keys.jwks().keys[0];
        assert_eq!(keys.jwks().keys.len(), 1);
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.alg, "RS256");
        assert_eq!(jwk.use_, "sig");
        assert_eq!(jwk.kid, keys.kid());
        assert_eq!(jwk.e, "AQAB");
    }

    #[test]
    fn test_jwks_serializes_use_field() {
        let keys = SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap();
        let value = serde_json::to_value(keys.jwks()).unwrap();
        assert_eq!(value["keys"][0]["use"], "sig");
        assert!(value["keys"][0].get("use_").is_none());
    }

    #[test]
    fn test_kid_is_stable_and_distinct() {
        let first = SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap();
        let second = SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap();
        let other = SigningKeys::from_private_pem(OTHER_PRIVATE_KEY_PEM).unwrap();

        assert_eq!(first.kid(), second.kid());
        assert_ne!(first.kid(), other.kid());
    }

    #[test]
    fn test_jwks_key_decodes() {
        let keys = SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap();
        let jwk = &keys.jwks().keys[0];
        assert!(DecodingKey::from_rsa_components(&jwk.n, &jwk.e).is_ok());
    }

    #[test]
    fn test_invalid_private_key() {
        let err = SigningKeys::from_private_pem("not a key").unwrap_err();
        assert!(matches!(err, KeyError::InvalidPrivateKey(_)));
    }

    #[test]
    fn test_load_existing_key_regenerates_public_half() {
        let dir = TempDir::new().unwrap();
        let private_path = dir.path().join("private.pem");
        let public_path = dir.path().join("public.pem");
        std::fs::write(&private_path, TEST_PRIVATE_KEY_PEM).unwrap();

        let config = KeysConfig {
            private_key_path: private_path.to_string_lossy().to_string(),
            public_key_path: public_path.to_string_lossy().to_string(),
            ..Default::default()
        };

        let keys = SigningKeys::load_or_generate(&config).unwrap();
        let written = std::fs::read_to_string(&public_path).unwrap();
        assert_eq!(written, keys.public_key_pem());
    }

    #[test]
    fn test_generate_when_missing() {
        let dir = TempDir::new().unwrap();
        let private_path = dir.path().join("nested").join("private.pem");
        let public_path = dir.path().join("nested").join("public.pem");

        let config = KeysConfig {
            private_key_path: private_path.to_string_lossy().to_string(),
            public_key_path: public_path.to_string_lossy().to_string(),
            ..Default::default()
        };

        let generated = SigningKeys::load_or_generate(&config).unwrap();
        assert!(private_path.exists());
        assert!(public_path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&private_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reloaded = SigningKeys::load_or_generate(&config).unwrap();
        assert_eq!(generated.kid(), reloaded.kid());
        assert_eq!(generated.public_key_pem(), reloaded.public_key_pem());
    }

    #[cfg(unix)]
    #[test]
    fn test_forced_regeneration_tightens_existing_key_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let private_path = dir.path().join("private.pem");
        let public_path = dir.path().join("public.pem");
        std::fs::write(&private_path, TEST_PRIVATE_KEY_PEM).unwrap();
        std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o644)).unwrap();

        SigningKeys::generate_and_persist(&private_path, &public_path, true).unwrap();

        let mode = std::fs::metadata(&private_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_ne!(
            std::fs::read_to_string(&private_path).unwrap(),
            TEST_PRIVATE_KEY_PEM
        );
    }

    #[test]
    fn test_generate_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let private_path = dir.path().join("private.pem");
        let public_path = dir.path().join("public.pem");
        std::fs::write(&private_path, TEST_PRIVATE_KEY_PEM).unwrap();

        let err = SigningKeys::generate_and_persist(&private_path, &public_path, false).unwrap_err();
        assert!(matches!(err, KeyError::AlreadyExists(_)));
        assert_eq!(
            std::fs::read_to_string(&private_path).unwrap(),
            TEST_PRIVATE_KEY_PEM
        );
    }

    #[tokio::test]
    async fn test_keys_health_checker() {
        let keys = Arc::new(SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap());
        let checker = keys.health_checker();
        assert_eq!(checker.name(), "keys");

        let result = checker.check().await;
        assert!(result.is_healthy());
        assert_eq!(result.details.unwrap()["kid"], keys.kid());
    }
}
