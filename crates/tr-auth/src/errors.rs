use thiserror::Error;

/// Errors surfaced by the account authentication pipeline
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Authorization denied by provider: {reason}")]
    Denied { reason: String },

    #[error("Malformed JSON response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Xbox Live response is missing the user hash claim")]
    MissingClaims,

    #[error("Stored token failed authentication and was discarded")]
    CorruptToken,

    #[error("No account is signed in")]
    NotSignedIn,

    #[error("Token refresh failed, sign in again: {source}")]
    RefreshFailed {
        #[source]
        source: Box<AuthError>,
    },

    #[error("A sign-in is already in progress")]
    SignInInProgress,

    #[error("Sign-in was cancelled")]
    Cancelled,

    #[error("Device code expired before the user completed verification")]
    PollTimedOut,

    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    pub fn http(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
        }
    }

    /// Status code for HTTP failures, `None` for everything else
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RefreshFailed { source } => source.status(),
            _ => None,
        }
    }

    /// Decode the XSTS `XErr` reason from a 401 returned by the XSTS endpoint
    pub fn xsts_denial(&self) -> Option<XstsError> {
        match self {
            Self::Http { status, body } if *status == reqwest::StatusCode::UNAUTHORIZED => {
                let value: serde_json::Value = serde_json::from_str(body).ok()?;
                value.get("XErr")?.as_u64().map(XstsError::from_xerr)
            }
            Self::RefreshFailed { source } => source.xsts_denial(),
            _ => None,
        }
    }
}

/// XSTS-specific error codes from XErr field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XstsError {
    #[error("Account doesn't have an Xbox account (XErr: 2148916233)")]
    NoXboxAccount,

    #[error("Xbox Live not available in this country (XErr: 2148916235)")]
    RegionNotSupported,

    #[error("Adult verification required on Xbox page (XErr: 2148916236/2148916237)")]
    AdultVerificationRequired,

    #[error("Child account requires Family (XErr: 2148916238)")]
    ChildAccountRequiresFamily,

    #[error("Unknown XSTS error code: {0}")]
    Unknown(u64),
}

impl XstsError {
    /// Parse XErr code from XSTS response
    pub fn from_xerr(code: u64) -> Self {
        match code {
            2148916233 => Self::NoXboxAccount,
            2148916235 => Self::RegionNotSupported,
            2148916236 | 2148916237 => Self::AdultVerificationRequired,
            2148916238 => Self::ChildAccountRequiresFamily,
            code => Self::Unknown(code),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
