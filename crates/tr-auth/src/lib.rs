//! Microsoft account sign-in for the Tritium launcher
//!
//! Implements the device-code flow used to obtain a Minecraft access token
//! from a Microsoft account, keeps the tokens encrypted on disk and caches
//! the player's profile.
//!
//! # Authentication Flow
//!
//! 1. Device-code authorization with Microsoft (the user enters a code in a browser)
//! 2. Xbox Live authentication
//! 3. XSTS authorization
//! 4. Minecraft Services login
//! 5. Profile retrieval
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tr_auth::{AuthClient, AuthConfig, AuthSession, EnvSecretProvider, FileTokenStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let secret = EnvSecretProvider::from_env()?;
//! let store = FileTokenStore::open(FileTokenStore::default_storage_dir()?, &secret).await?;
//! let client = AuthClient::new(AuthConfig::new("00000000-0000-0000-0000-000000000000"))?;
//! let session = AuthSession::new(client, Arc::new(store));
//!
//! let profile = session
//!     .sign_in(CancellationToken::new(), |challenge| {
//!         println!("Open {} and enter {}", challenge.verification_uri, challenge.user_code);
//!     })
//!     .await?;
//!
//! if let Some(profile) = profile {
//!     println!("Signed in as {}", profile.name);
//! }
//!
//! // Later, before launching the game
//! let token = session.ensure_valid_access_token().await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```
//!
//! # Token Storage
//!
//! [`FileTokenStore`] encrypts each token with AES-256-GCM under a data key
//! kept in a passphrase-protected key container. The passphrase comes from
//! the `TRITIUM_LAUNCHER_KEYSTORE_PASSWORD` environment variable; opening the
//! store without it is a configuration error. [`MemoryTokenStore`] is provided
//! for tests.
//!
//! # Important Notes
//!
//! - You need an Azure application id that Mojang has approved for Minecraft
//! - Tokens are never logged
//! - The access token expiry is stored with the tokens; when it is missing
//!   the first [`AuthSession::ensure_valid_access_token`] call refreshes

pub mod client;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod file_store;
pub mod key_manager;
pub mod models;
pub mod profile_cache;
pub mod secret;
pub mod session;
pub mod store;
pub mod tokens;

// Re-export main types
pub use client::AuthClient;
pub use config::{AuthConfig, Endpoints, HttpTimeouts, PollPolicy, RetryPolicy};
pub use errors::{AuthError, Result, XstsError};
pub use file_store::FileTokenStore;
pub use key_manager::KdfParams;
pub use models::{MinecraftProfile, PlayerUuid, SkinVariant, TexturesPayload};
pub use profile_cache::{ListenerId, ProfileCache};
pub use secret::{EnvSecretProvider, NoSecretProvider, SecretProvider, StaticSecretProvider};
pub use session::{AuthSession, AuthState};
pub use store::{MemoryTokenStore, TokenStore};
pub use tokens::{DeviceCodeChallenge, PollOutcome, TokenKind, TokenSet, XboxTokenPair};
