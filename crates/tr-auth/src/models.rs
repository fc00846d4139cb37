use serde::{Deserialize, Serialize};

/// Device authorization response from the Microsoft identity platform
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    #[serde(default = "default_device_code_lifetime")]
    pub expires_in: u64,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_device_code_lifetime() -> u64 {
    900
}

fn default_poll_interval() -> u64 {
    5
}

/// Microsoft OAuth token response (device_code and refresh_token grants)
#[derive(Debug, Clone, Deserialize)]
pub struct MsTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth error body (`authorization_pending`, `expired_token`, ...)
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Xbox Live user.authenticate request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthRequest {
    pub properties: XblAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthProperties {
    pub auth_method: String,
    pub site_name: String,
    pub rps_ticket: String,
}

/// Xbox Live user.authenticate / XSTS authorize response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XboxAuthResponse {
    pub token: String,
    pub display_claims: XblDisplayClaims,
    #[serde(default)]
    pub issue_instant: Option<String>,
    #[serde(default)]
    pub not_after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XblDisplayClaims {
    #[serde(default)]
    pub xui: Vec<XblUserInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XblUserInfo {
    pub uhs: String,
}

/// XSTS authorize request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthRequest {
    pub properties: XstsAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthProperties {
    pub sandbox_id: String,
    pub user_tokens: Vec<String>,
}

/// Minecraft login_with_xbox request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McLoginRequest {
    pub identity_token: String,
}

/// Minecraft login_with_xbox response
#[derive(Debug, Clone, Deserialize)]
pub struct McLoginResponse {
    /// Not the player UUID
    #[serde(default)]
    pub username: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: i64,
}

/// Minecraft profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinecraftProfile {
    /// UUID without dashes
    pub id: String,
    /// Player name
    pub name: String,
    #[serde(default)]
    pub skins: Vec<Skin>,
    #[serde(default)]
    pub capes: Vec<Cape>,
}

impl MinecraftProfile {
    pub fn active_skin(&self) -> Option<&Skin> {
        self.skins.iter().find(|s| s.state == "ACTIVE")
    }

    pub fn active_cape(&self) -> Option<&Cape> {
        self.capes.iter().find(|c| c.state == "ACTIVE")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Skin {
    pub id: String,
    pub state: String,
    pub url: String,
    pub variant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cape {
    pub id: String,
    pub state: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Skin model accepted by the skin endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkinVariant {
    Classic,
    Slim,
}

impl SkinVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkinVariant::Classic => "classic",
            SkinVariant::Slim => "slim",
        }
    }
}

/// Public name to UUID mapping from the Mojang API
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PlayerUuid {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub legacy: bool,
    #[serde(default)]
    pub demo: bool,
}

/// Session server profile
#[derive(Debug, Clone, Deserialize)]
pub struct SessionProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<SessionProperty>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionProperty {
    /// Only `textures` is ever sent
    pub name: String,
    /// Base64-encoded [`TexturesPayload`]
    pub value: String,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Decoded `textures` property
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TexturesPayload {
    /// Unix time in milliseconds
    pub timestamp: i64,
    pub profile_id: String,
    pub profile_name: String,
    #[serde(default)]
    pub signature_required: bool,
    pub textures: Textures,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub struct Textures {
    #[serde(default)]
    pub skin: Option<SkinTexture>,
    #[serde(default)]
    pub cape: Option<CapeTexture>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SkinTexture {
    pub url: String,
    #[serde(default)]
    pub metadata: Option<SkinMetadata>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SkinMetadata {
    pub model: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CapeTexture {
    pub url: String,
}
