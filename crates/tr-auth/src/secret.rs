use zeroize::Zeroizing;

use crate::config::KEYSTORE_PASSWORD_ENV;
use crate::errors::{AuthError, Result};

/// Trait for providing the passphrase that unlocks the key container
#[async_trait::async_trait]
pub trait SecretProvider: Send + Sync {
    /// Get the key container passphrase
    ///
    /// Returns None if no passphrase is available.
    /// The returned string will be automatically zeroized when dropped.
    async fn get_passphrase(&self) -> Option<Zeroizing<String>>;
}

/// Passphrase read once from an environment variable
pub struct EnvSecretProvider {
    secret: Zeroizing<String>,
}

impl EnvSecretProvider {
    /// Read [`KEYSTORE_PASSWORD_ENV`]; an unset or empty variable is a fatal configuration error
    pub fn from_env() -> Result<Self> {
        Self::from_var(KEYSTORE_PASSWORD_ENV)
    }

    pub fn from_var(name: &str) -> Result<Self> {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(Self {
                secret: Zeroizing::new(value),
            }),
            _ => Err(AuthError::Config(format!(
                "Environment variable {} is not set",
                name
            ))),
        }
    }
}

impl std::fmt::Debug for EnvSecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EnvSecretProvider([REDACTED])")
    }
}

#[async_trait::async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_passphrase(&self) -> Option<Zeroizing<String>> {
        Some(self.secret.clone())
    }
}

/// Static secret provider for testing
#[derive(Debug, Clone)]
pub struct StaticSecretProvider {
    secret: String,
}

impl StaticSecretProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait::async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_passphrase(&self) -> Option<Zeroizing<String>> {
        Some(Zeroizing::new(self.secret.clone()))
    }
}

/// Provider that never has a passphrase
#[derive(Debug, Clone, Default)]
pub struct NoSecretProvider;

#[async_trait::async_trait]
impl SecretProvider for NoSecretProvider {
    async fn get_passphrase(&self) -> Option<Zeroizing<String>> {
        None
    }
}
