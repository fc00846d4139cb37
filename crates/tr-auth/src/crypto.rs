use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{AuthError, Result};
use crate::tokens::TokenKind;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// AES-256 key (32 bytes)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        fill_random(&mut key)?;
        Ok(Self { key })
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { key: bytes }
    }

    /// Get key bytes (use carefully - sensitive data)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AuthError::Crypto(format!("Invalid key length: {}", e)))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

pub(crate) fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|e| AuthError::Crypto(format!("OS randomness unavailable: {}", e)))
}

/// Encrypt with a fresh random nonce, returning `nonce ‖ ciphertext ‖ tag`
pub fn seal(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = key.cipher()?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    fill_random(&mut nonce_bytes)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| AuthError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverse of [`seal`]; any authentication failure is [`AuthError::CorruptToken`]
pub fn open(key: &EncryptionKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(AuthError::CorruptToken);
    }

    let cipher = key.cipher()?;
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AuthError::CorruptToken)
}

fn token_aad(kind: TokenKind) -> String {
    format!("tr-auth|v1|{}", kind.label())
}

/// Encrypt a token for storage as base64 text
pub fn encrypt_token(key: &EncryptionKey, kind: TokenKind, plaintext: &str) -> Result<String> {
    let sealed = seal(key, plaintext.as_bytes(), token_aad(kind).as_bytes())?;
    Ok(STANDARD.encode(sealed))
}

/// Decrypt a stored token; malformed base64, a bad tag or invalid UTF-8 are all corruption
pub fn decrypt_token(key: &EncryptionKey, kind: TokenKind, encoded: &[u8]) -> Result<String> {
    let sealed = STANDARD.decode(encoded).map_err(|_| AuthError::CorruptToken)?;
    let plaintext = open(key, &sealed, token_aad(kind).as_bytes())?;

    String::from_utf8(plaintext).map_err(|e| {
        let mut bytes = e.into_bytes();
        bytes.zeroize();
        AuthError::CorruptToken
    })
}
