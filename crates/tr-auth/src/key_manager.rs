use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptionKey, KEY_LEN};
use crate::errors::{AuthError, Result};
use crate::file_store::write_atomic;
use crate::secret::SecretProvider;

pub const KEYSTORE_FILE: &str = "keystore.json";

const KEYSTORE_VERSION: u32 = 1;
const SALT_LEN: usize = 32;
const WRAP_AAD: &[u8] = b"tr-auth|keystore|v1";

/// Argon2id cost parameters, stored alongside the salt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// m=64MB, t=3, p=1
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| AuthError::Crypto(format!("Invalid Argon2 params: {}", e)))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// On-disk key container: the data key wrapped under a passphrase-derived key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyContainer {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
    pub kdf: KdfParams,
    /// Base64-encoded salt for Argon2id
    pub salt: String,
    /// Base64 of nonce ‖ wrapped data key ‖ tag
    pub wrapped_key: String,
}

/// Owns the token encryption key for one installation
///
/// The data key is generated once, wrapped with a key derived from the
/// passphrase and persisted in `keystore.json`. A missing or wrong
/// passphrase fails [`KeyManager::open`] with [`AuthError::Config`].
pub struct KeyManager {
    path: PathBuf,
    container: KeyContainer,
    wrapping_key: EncryptionKey,
    key: EncryptionKey,
}

impl KeyManager {
    pub async fn open(storage_dir: &Path, secret_provider: &dyn SecretProvider) -> Result<Self> {
        Self::open_with_params(storage_dir, secret_provider, KdfParams::default()).await
    }

    /// Open or create the key container; `params` only applies when creating
    pub async fn open_with_params(
        storage_dir: &Path,
        secret_provider: &dyn SecretProvider,
        params: KdfParams,
    ) -> Result<Self> {
        let passphrase = secret_provider.get_passphrase().await.ok_or_else(|| {
            AuthError::Config("No passphrase available for the key container".to_string())
        })?;

        let path = storage_dir.join(KEYSTORE_FILE);

        if fs::try_exists(&path).await? {
            Self::unlock(path, passphrase).await
        } else {
            Self::create(path, passphrase, params).await
        }
    }

    async fn unlock(path: PathBuf, passphrase: Zeroizing<String>) -> Result<Self> {
        let content = fs::read_to_string(&path).await?;
        let container: KeyContainer = serde_json::from_str(&content)
            .map_err(|e| AuthError::Config(format!("Invalid {}: {}", KEYSTORE_FILE, e)))?;

        if container.version != KEYSTORE_VERSION {
            return Err(AuthError::Config(format!(
                "Unsupported key container version {}",
                container.version
            )));
        }

        let salt = STANDARD
            .decode(&container.salt)
            .map_err(|_| AuthError::Config(format!("Corrupted salt in {}", KEYSTORE_FILE)))?;
        let wrapping_key = derive_wrapping_key(passphrase, salt, container.kdf).await?;

        let wrapped = STANDARD
            .decode(&container.wrapped_key)
            .map_err(|_| AuthError::Config(format!("Corrupted key in {}", KEYSTORE_FILE)))?;
        let key_bytes = Zeroizing::new(
            crypto::open(&wrapping_key, &wrapped, WRAP_AAD).map_err(|_| {
                AuthError::Config(
                    "Key container passphrase rejected or container tampered".to_string(),
                )
            })?,
        );

        let key: [u8; KEY_LEN] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::Config(format!("Wrong key length in {}", KEYSTORE_FILE)))?;

        tracing::debug!("Unlocked key container at {}", path.display());

        Ok(Self {
            path,
            container,
            wrapping_key,
            key: EncryptionKey::from_bytes(key),
        })
    }

    async fn create(path: PathBuf, passphrase: Zeroizing<String>, params: KdfParams) -> Result<Self> {
        let mut salt = vec![0u8; SALT_LEN];
        crypto::fill_random(&mut salt)?;

        let wrapping_key = derive_wrapping_key(passphrase, salt.clone(), params).await?;
        let key = EncryptionKey::generate()?;

        let container = KeyContainer {
            version: KEYSTORE_VERSION,
            created_at: Utc::now(),
            rotated_at: None,
            kdf: params,
            salt: STANDARD.encode(&salt),
            wrapped_key: wrap(&wrapping_key, &key)?,
        };

        persist(&path, &container).await?;
        tracing::info!("Created key container at {}", path.display());

        Ok(Self {
            path,
            container,
            wrapping_key,
            key,
        })
    }

    /// Get the encryption key
    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    pub fn container(&self) -> &KeyContainer {
        &self.container
    }

    /// Generate a replacement data key and the container that wraps it
    ///
    /// Nothing is written until [`KeyManager::commit_rotation`], so callers
    /// can re-encrypt their data under the new key first.
    pub fn prepare_rotation(&self) -> Result<(EncryptionKey, KeyContainer)> {
        let new_key = EncryptionKey::generate()?;

        let mut container = self.container.clone();
        container.wrapped_key = wrap(&self.wrapping_key, &new_key)?;
        container.rotated_at = Some(Utc::now());

        Ok((new_key, container))
    }

    /// Persist a container from [`KeyManager::prepare_rotation`] and switch to its key
    pub async fn commit_rotation(&mut self, key: EncryptionKey, container: KeyContainer) -> Result<()> {
        persist(&self.path, &container).await?;
        self.container = container;
        self.key = key;

        tracing::info!("Rotated token encryption key");
        Ok(())
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("path", &self.path)
            .field("container", &self.container)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

async fn persist(path: &Path, container: &KeyContainer) -> Result<()> {
    let json = serde_json::to_string_pretty(container)?;
    write_atomic(path, json.as_bytes()).await
}

fn wrap(wrapping_key: &EncryptionKey, key: &EncryptionKey) -> Result<String> {
    let sealed = crypto::seal(wrapping_key, key.as_bytes(), WRAP_AAD)?;
    Ok(STANDARD.encode(sealed))
}

/// Derive key from passphrase using Argon2id, off the async runtime
async fn derive_wrapping_key(
    passphrase: Zeroizing<String>,
    salt: Vec<u8>,
    params: KdfParams,
) -> Result<EncryptionKey> {
    tokio::task::spawn_blocking(move || {
        let argon2 = params.argon2()?;
        let mut out = Zeroizing::new([0u8; KEY_LEN]);

        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut out[..])
            .map_err(|e| AuthError::Crypto(format!("Key derivation failed: {}", e)))?;

        Ok(EncryptionKey::from_bytes(*out))
    })
    .await
    .map_err(|e| AuthError::Crypto(format!("Key derivation task failed: {}", e)))?
}
