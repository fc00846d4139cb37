use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::{AuthError, Result};
use crate::tokens::TokenKind;

/// Trait for persisting the bearer tokens of the signed-in account
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    /// Store `plaintext` under `kind`, replacing any previous value
    async fn save(&self, kind: TokenKind, plaintext: &str) -> Result<()>;

    /// `Ok(None)` when nothing is stored, [`AuthError::CorruptToken`] when the
    /// stored value fails authentication
    async fn load(&self, kind: TokenKind) -> Result<Option<String>>;

    /// Remove the token; idempotent and never fails the caller
    async fn delete(&self, kind: TokenKind);

    /// Remove every token kind
    async fn clear(&self) {
        for kind in TokenKind::ALL {
            self.delete(kind).await;
        }
    }
}

/// In-memory token store for testing and simple use cases
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    tokens: Arc<RwLock<HashMap<TokenKind, String>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save(&self, kind: TokenKind, plaintext: &str) -> Result<()> {
        self.tokens
            .write()
            .map_err(|_| AuthError::InvalidResponse("Lock poisoned".to_string()))?
            .insert(kind, plaintext.to_string());
        Ok(())
    }

    async fn load(&self, kind: TokenKind) -> Result<Option<String>> {
        Ok(self
            .tokens
            .read()
            .map_err(|_| AuthError::InvalidResponse("Lock poisoned".to_string()))?
            .get(&kind)
            .cloned())
    }

    async fn delete(&self, kind: TokenKind) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.remove(&kind);
        }
    }
}
