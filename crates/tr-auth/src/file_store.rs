use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptionKey};
use crate::errors::{AuthError, Result};
use crate::key_manager::{KdfParams, KeyManager};
use crate::secret::SecretProvider;
use crate::store::TokenStore;
use crate::tokens::TokenKind;

/// File-based encrypted token store
///
/// Each token kind lives in its own file holding base64 of
/// `nonce ‖ ciphertext ‖ tag` (AES-256-GCM). The data key comes from the
/// passphrase-protected key container managed by [`KeyManager`].
///
/// # Directory Structure
/// ```text
/// ~/.local/share/tritium/auth/
/// ├── keystore.json        # Wrapped data key + KDF parameters
/// ├── access_token.bin     # Encrypted Minecraft access token
/// ├── refresh_token.bin    # Encrypted Microsoft refresh token
/// └── expires_at.bin       # Encrypted access token expiry (epoch millis)
/// ```
///
/// During [`FileTokenStore::rotate_key`] re-encrypted copies are staged as
/// `*.bin.rotating` until the new key container is committed.
#[derive(Debug)]
pub struct FileTokenStore {
    storage_dir: PathBuf,
    key_manager: RwLock<KeyManager>,
}

impl FileTokenStore {
    /// Open the store, creating the directory and key container on first use
    ///
    /// Fails with [`AuthError::Config`] when the passphrase is missing or wrong.
    pub async fn open(
        storage_dir: impl AsRef<Path>,
        secret_provider: &dyn SecretProvider,
    ) -> Result<Self> {
        Self::open_with_params(storage_dir, secret_provider, KdfParams::default()).await
    }

    pub async fn open_with_params(
        storage_dir: impl AsRef<Path>,
        secret_provider: &dyn SecretProvider,
        params: KdfParams,
    ) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        ensure_private_dir(&storage_dir).await?;

        let key_manager =
            KeyManager::open_with_params(&storage_dir, secret_provider, params).await?;

        let store = Self {
            storage_dir,
            key_manager: RwLock::new(key_manager),
        };

        let recovered = {
            let key_manager = store.key_manager.read().await;
            store.finish_staged_rotation(key_manager.key()).await?
        };
        if recovered > 0 {
            tracing::warn!("Recovered {} token(s) from an interrupted key rotation", recovered);
        }

        Ok(store)
    }

    /// Get default storage directory for the current platform
    pub fn default_storage_dir() -> Result<PathBuf> {
        let project_dirs = directories::ProjectDirs::from("io.github", "footermandev", "tritium")
            .ok_or_else(|| AuthError::Config("Could not determine data directory".to_string()))?;

        Ok(project_dirs.data_dir().join("auth"))
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Get the path for a token file
    pub fn token_path(&self, kind: TokenKind) -> PathBuf {
        self.storage_dir.join(kind.file_name())
    }

    fn staged_path(&self, kind: TokenKind) -> PathBuf {
        self.storage_dir.join(format!("{}.rotating", kind.file_name()))
    }

    async fn read_token(&self, key: &EncryptionKey, kind: TokenKind) -> Result<Option<String>> {
        let encoded = match fs::read(self.token_path(kind)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        crypto::decrypt_token(key, kind, &encoded).map(Some)
    }

    async fn write_token(&self, key: &EncryptionKey, kind: TokenKind, plaintext: &str) -> Result<()> {
        ensure_private_dir(&self.storage_dir).await?;

        let encoded = crypto::encrypt_token(key, kind, plaintext)?;
        write_atomic(&self.token_path(kind), encoded.as_bytes()).await
    }

    /// Rotate the data key and re-encrypt every stored token under it
    ///
    /// Re-encrypted tokens are staged beside the live files, the new key
    /// container is committed, then the staged files are renamed into place.
    /// A crash at any point leaves every token readable on the next open.
    pub async fn rotate_key(&self) -> Result<()> {
        let mut key_manager = self.key_manager.write().await;
        let (new_key, container) = key_manager.prepare_rotation()?;

        for kind in TokenKind::ALL {
            if let Some(token) = self.read_token(key_manager.key(), kind).await? {
                let token = Zeroizing::new(token);
                let encoded = crypto::encrypt_token(&new_key, kind, &token)?;
                write_atomic(&self.staged_path(kind), encoded.as_bytes()).await?;
            }
        }

        key_manager.commit_rotation(new_key, container).await?;
        let moved = self.finish_staged_rotation(key_manager.key()).await?;

        tracing::info!("Re-encrypted {} stored token(s) under the new key", moved);
        Ok(())
    }

    /// Move staged tokens that open under `key` into place and drop the rest
    ///
    /// Staged files that do not open under the current key belong to a
    /// rotation whose container was never committed.
    async fn finish_staged_rotation(&self, key: &EncryptionKey) -> Result<usize> {
        let mut moved = 0;

        for kind in TokenKind::ALL {
            let staged = self.staged_path(kind);
            let encoded = match fs::read(&staged).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if crypto::decrypt_token(key, kind, &encoded).is_ok() {
                fs::rename(&staged, self.token_path(kind)).await?;
                moved += 1;
            } else {
                tracing::warn!("Discarding staged {} token from an unfinished key rotation", kind);
                fs::remove_file(&staged).await?;
            }
        }

        Ok(moved)
    }
}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, kind: TokenKind, plaintext: &str) -> Result<()> {
        let key_manager = self.key_manager.read().await;
        self.write_token(key_manager.key(), kind, plaintext).await?;

        tracing::info!("Saved {} token", kind);
        Ok(())
    }

    async fn load(&self, kind: TokenKind) -> Result<Option<String>> {
        let key_manager = self.key_manager.read().await;

        match self.read_token(key_manager.key(), kind).await {
            Ok(token) => Ok(token),
            Err(AuthError::CorruptToken) => {
                tracing::warn!("Stored {} token failed authentication", kind);
                Err(AuthError::CorruptToken)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, kind: TokenKind) {
        match fs::remove_file(self.token_path(kind)).await {
            Ok(()) => tracing::info!("Deleted {} token", kind),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::error!("Failed to delete {} token: {}", kind, e),
        }
    }
}

async fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).await?;

    // Set secure permissions (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }

    Ok(())
}

/// Write to a sibling temp file, sync, then rename over `path`
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    // A leftover temp file would keep its old mode
    match fs::remove_file(&temp_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&temp_path).await?;

    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    Ok(())
}
