use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{DEFAULT_EXPIRES_IN, MIN_POLL_INTERVAL_SECS};
use crate::models::{DeviceCodeResponse, MsTokenResponse};

/// Which bearer token a stored file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
    /// Expiry of the access token, as Unix milliseconds
    ExpiresAt,
}

impl TokenKind {
    pub const ALL: [TokenKind; 3] = [TokenKind::Access, TokenKind::Refresh, TokenKind::ExpiresAt];

    pub fn file_name(&self) -> &'static str {
        match self {
            TokenKind::Access => "access_token.bin",
            TokenKind::Refresh => "refresh_token.bin",
            TokenKind::ExpiresAt => "expires_at.bin",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::ExpiresAt => "expires_at",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One device-code sign-in attempt, shown to the user while polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeChallenge {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub poll_interval: Duration,
    /// How long the device code stays valid
    pub expires_in: Duration,
}

impl From<DeviceCodeResponse> for DeviceCodeChallenge {
    fn from(response: DeviceCodeResponse) -> Self {
        Self {
            device_code: response.device_code,
            user_code: response.user_code,
            verification_uri: response.verification_uri,
            poll_interval: Duration::from_secs(response.interval.max(MIN_POLL_INTERVAL_SECS)),
            expires_in: Duration::from_secs(response.expires_in),
        }
    }
}

/// Bearer tokens and their expiry
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    /// Build from a token endpoint response received at `received_at`
    pub fn from_response(response: MsTokenResponse, received_at: DateTime<Utc>) -> Self {
        let expires_in = if response.expires_in > 0 {
            response.expires_in
        } else {
            DEFAULT_EXPIRES_IN
        };

        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: received_at + chrono::Duration::seconds(expires_in),
        }
    }

    pub fn expires_at_millis(&self) -> i64 {
        self.expires_at.timestamp_millis()
    }

    /// Parse an expiry written by [`TokenSet::expires_at_millis`]
    pub fn parse_expiry(millis: &str) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis.trim().parse().ok()?)
    }

    /// True once `now` is inside the refresh buffer before expiry
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        needs_refresh(self.expires_at, now, buffer)
    }
}

pub(crate) fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>, buffer: Duration) -> bool {
    let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::seconds(60));
    now >= expires_at - buffer
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Xbox Live user token plus the user hash needed for the Minecraft identity string
#[derive(Clone, PartialEq, Eq)]
pub struct XboxTokenPair {
    pub xbl_token: String,
    pub user_hash: String,
}

impl fmt::Debug for XboxTokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XboxTokenPair")
            .field("xbl_token", &"[REDACTED]")
            .field("user_hash", &self.user_hash)
            .finish()
    }
}

/// Result of a single poll of the token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The user has not finished verification yet
    Pending,
    /// Poll less often
    SlowDown,
    Authorized(TokenSet),
}
