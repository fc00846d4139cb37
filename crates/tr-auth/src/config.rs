use std::time::Duration;

use url::Url;

use crate::errors::Result;

/// Microsoft, Xbox Live and Minecraft Services endpoints
pub mod endpoints {
    pub const MS_DEVICE_CODE: &str =
        "https://login.microsoftonline.com/consumers/oauth2/v2.0/devicecode";
    pub const MS_TOKEN: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
    pub const XBL_AUTHENTICATE: &str = "https://user.auth.xboxlive.com/user/authenticate";
    pub const XSTS_AUTHORIZE: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
    pub const MC_LOGIN: &str = "https://api.minecraftservices.com/authentication/login_with_xbox";
    pub const MC_PROFILE: &str = "https://api.minecraftservices.com/minecraft/profile";
    pub const MOJANG_PROFILES: &str = "https://api.mojang.com/users/profiles/minecraft";
    pub const SESSION_PROFILE: &str = "https://sessionserver.mojang.com/session/minecraft/profile";
}

/// OAuth scope requested for every Microsoft token
pub const SCOPE: &str = "XboxLive.signin offline_access";

pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Relying parties
pub const RP_XBOXLIVE_AUTH: &str = "http://auth.xboxlive.com";
pub const RP_MINECRAFT: &str = "rp://api.minecraftservices.com/";

/// Tokens are refreshed this long before their reported expiry
pub const REFRESH_BUFFER: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token endpoint reports a non-positive `expires_in`
pub const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Lower bound for the server-advertised poll interval
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;

/// Extra wait added to the poll interval when the server answers `slow_down`
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Environment variable holding the key container passphrase
pub const KEYSTORE_PASSWORD_ENV: &str = "TRITIUM_LAUNCHER_KEYSTORE_PASSWORD";

/// Every URL the client talks to
///
/// Production code uses [`Endpoints::default`]; tests point everything at a
/// mock server with [`Endpoints::with_base`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub device_code: Url,
    pub token: Url,
    pub xbl_authenticate: Url,
    pub xsts_authorize: Url,
    pub mc_login: Url,
    pub mc_profile: Url,
    pub mojang_profiles: Url,
    pub session_profile: Url,
}

impl Endpoints {
    /// Route every endpoint to `base`, keeping the original paths
    pub fn with_base(base: &str) -> Result<Self> {
        let base = Url::parse(base)?;
        let rebase = |original: &str| -> Result<Url> {
            let original = Url::parse(original)?;
            Ok(base.join(original.path())?)
        };

        Ok(Self {
            device_code: rebase(endpoints::MS_DEVICE_CODE)?,
            token: rebase(endpoints::MS_TOKEN)?,
            xbl_authenticate: rebase(endpoints::XBL_AUTHENTICATE)?,
            xsts_authorize: rebase(endpoints::XSTS_AUTHORIZE)?,
            mc_login: rebase(endpoints::MC_LOGIN)?,
            mc_profile: rebase(endpoints::MC_PROFILE)?,
            mojang_profiles: rebase(endpoints::MOJANG_PROFILES)?,
            session_profile: rebase(endpoints::SESSION_PROFILE)?,
        })
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        let parse = |s: &str| Url::parse(s).expect("static endpoint URL is valid");
        Self {
            device_code: parse(endpoints::MS_DEVICE_CODE),
            token: parse(endpoints::MS_TOKEN),
            xbl_authenticate: parse(endpoints::XBL_AUTHENTICATE),
            xsts_authorize: parse(endpoints::XSTS_AUTHORIZE),
            mc_login: parse(endpoints::MC_LOGIN),
            mc_profile: parse(endpoints::MC_PROFILE),
            mojang_profiles: parse(endpoints::MOJANG_PROFILES),
            session_profile: parse(endpoints::SESSION_PROFILE),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Retry policy for transport failures while polling the token endpoint
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Bounds on the device-code polling loop
///
/// The device code's own lifetime always applies; `max_attempts` adds a hard
/// cap on top of it.
#[derive(Debug, Clone, Default)]
pub struct PollPolicy {
    pub max_attempts: Option<u32>,
    /// Replaces the server-advertised interval
    pub interval_override: Option<Duration>,
}

/// Configuration for [`AuthClient`](crate::AuthClient) and [`AuthSession`](crate::AuthSession)
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Azure application (client) id
    pub client_id: String,

    pub endpoints: Endpoints,

    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    pub retry: RetryPolicy,

    pub poll: PollPolicy,

    pub refresh_buffer: Duration,
}

impl AuthConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            endpoints: Endpoints::default(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("tritium".to_string()),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            refresh_buffer: REFRESH_BUFFER,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }
}
