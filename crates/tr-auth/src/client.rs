use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::{
    AuthConfig, GRANT_DEVICE_CODE, GRANT_REFRESH_TOKEN, RP_MINECRAFT, RP_XBOXLIVE_AUTH, SCOPE,
};
use crate::errors::{AuthError, Result};
use crate::models::*;
use crate::tokens::{DeviceCodeChallenge, PollOutcome, TokenSet, XboxTokenPair};

/// Stateless client for every hop of the Microsoft → Xbox Live → Minecraft chain
///
/// Every call fails with [`AuthError::Http`] on a non-2xx status and with
/// [`AuthError::Parse`] when the body is not the expected JSON.
#[derive(Debug, Clone)]
pub struct AuthClient {
    config: AuthConfig,
    http: Client,
}

impl AuthClient {
    /// Create a new authentication client
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or("tritium"))
            .build()?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Start a device-code sign-in
    #[instrument(skip(self))]
    pub async fn request_device_code(&self) -> Result<DeviceCodeChallenge> {
        debug!("Requesting device code");
        let response = self
            .http
            .post(self.config.endpoints.device_code.clone())
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("scope", SCOPE),
            ])
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(http_error(response).await);
        }

        let response: DeviceCodeResponse = read_json(response).await?;
        Ok(response.into())
    }

    /// Poll the token endpoint once for the outcome of `challenge`
    #[instrument(skip(self, challenge))]
    pub async fn poll_for_token(&self, challenge: &DeviceCodeChallenge) -> Result<PollOutcome> {
        let response = self
            .http
            .post(self.config.endpoints.token.clone())
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("grant_type", GRANT_DEVICE_CODE),
                ("device_code", challenge.device_code.as_str()),
                ("scope", SCOPE),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let error: OAuthErrorResponse = read_json(response).await?;
            return match error.error.as_str() {
                "authorization_pending" => {
                    debug!("Authorization pending");
                    Ok(PollOutcome::Pending)
                }
                "slow_down" => {
                    debug!("Server asked to slow down polling");
                    Ok(PollOutcome::SlowDown)
                }
                _ => {
                    warn!("Device code polling rejected: {}", error.error);
                    Err(AuthError::Denied {
                        reason: error.error,
                    })
                }
            };
        }

        let tokens: MsTokenResponse = read_json(ensure_success(response).await?).await?;
        debug!("Microsoft token acquired, expires in {}s", tokens.expires_in);
        Ok(PollOutcome::Authorized(TokenSet::from_response(
            tokens,
            Utc::now(),
        )))
    }

    /// Redeem a refresh token for a new Microsoft token set
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenSet> {
        debug!("Refreshing Microsoft access token");
        let response = self
            .http
            .post(self.config.endpoints.token.clone())
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("grant_type", GRANT_REFRESH_TOKEN),
                ("refresh_token", refresh_token),
                ("scope", SCOPE),
            ])
            .send()
            .await?;

        let tokens: MsTokenResponse = read_json(ensure_success(response).await?).await?;
        Ok(TokenSet::from_response(tokens, Utc::now()))
    }

    /// Authenticate with Xbox Live
    #[instrument(skip(self, ms_access_token))]
    pub async fn exchange_for_xbox_live_token(&self, ms_access_token: &str) -> Result<XboxTokenPair> {
        let request = XblAuthRequest {
            properties: XblAuthProperties {
                auth_method: "RPS".to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket: format!("d={}", ms_access_token),
            },
            relying_party: RP_XBOXLIVE_AUTH.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authenticating with Xbox Live");
        let response = self
            .http
            .post(self.config.endpoints.xbl_authenticate.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let xbl_response: XboxAuthResponse = read_json(ensure_success(response).await?).await?;
        let user_hash = xbl_response
            .display_claims
            .xui
            .into_iter()
            .next()
            .ok_or(AuthError::MissingClaims)?
            .uhs;

        Ok(XboxTokenPair {
            xbl_token: xbl_response.token,
            user_hash,
        })
    }

    /// Authorize with XSTS for the Minecraft relying party
    #[instrument(skip(self, xbl_token))]
    pub async fn exchange_for_xsts_token(&self, xbl_token: &str) -> Result<String> {
        let request = XstsAuthRequest {
            properties: XstsAuthProperties {
                sandbox_id: "RETAIL".to_string(),
                user_tokens: vec![xbl_token.to_string()],
            },
            relying_party: RP_MINECRAFT.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authorizing with XSTS");
        let response = self
            .http
            .post(self.config.endpoints.xsts_authorize.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let xsts_response: XboxAuthResponse = read_json(ensure_success(response).await?).await?;
        Ok(xsts_response.token)
    }

    /// Login to Minecraft with the XSTS token
    #[instrument(skip(self, xsts_token, user_hash))]
    pub async fn exchange_for_minecraft_token(&self, xsts_token: &str, user_hash: &str) -> Result<String> {
        let request = McLoginRequest {
            identity_token: format!("XBL3.0 x={};{}", user_hash, xsts_token),
        };

        debug!("Logging in to Minecraft Services");
        let response = self
            .http
            .post(self.config.endpoints.mc_login.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let mc_response: McLoginResponse = read_json(ensure_success(response).await?).await?;
        Ok(mc_response.access_token)
    }

    /// Run XBL → XSTS → Minecraft for a Microsoft access token
    pub async fn exchange_chain(&self, ms_access_token: &str) -> Result<String> {
        let xbox = self.exchange_for_xbox_live_token(ms_access_token).await?;
        let xsts_token = self.exchange_for_xsts_token(&xbox.xbl_token).await?;
        self.exchange_for_minecraft_token(&xsts_token, &xbox.user_hash)
            .await
    }

    /// Fetch Minecraft profile
    ///
    /// `Ok(None)` means the account owns no Minecraft license.
    #[instrument(skip(self, mc_access_token))]
    pub async fn fetch_profile(&self, mc_access_token: &str) -> Result<Option<MinecraftProfile>> {
        debug!("Fetching Minecraft profile");
        let response = self
            .http
            .get(self.config.endpoints.mc_profile.clone())
            .bearer_auth(mc_access_token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Account has no Minecraft profile");
            return Ok(None);
        }

        read_json(ensure_success(response).await?).await.map(Some)
    }

    /// Change the player name
    #[instrument(skip(self, mc_access_token))]
    pub async fn change_name(&self, mc_access_token: &str, new_name: &str) -> Result<()> {
        let url = child_url(&self.config.endpoints.mc_profile, &["name", new_name])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(mc_access_token)
            .send()
            .await?;

        ensure_success(response).await?;
        Ok(())
    }

    /// Switch to a skin hosted at `skin_url`
    #[instrument(skip(self, mc_access_token))]
    pub async fn set_skin_from_url(
        &self,
        mc_access_token: &str,
        skin_url: &str,
        variant: SkinVariant,
    ) -> Result<()> {
        let url = child_url(&self.config.endpoints.mc_profile, &["skins"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(mc_access_token)
            .json(&serde_json::json!({ "variant": variant, "url": skin_url }))
            .send()
            .await?;

        ensure_success(response).await?;
        Ok(())
    }

    /// Upload a PNG skin file
    #[instrument(skip(self, mc_access_token, png))]
    pub async fn upload_skin(
        &self,
        mc_access_token: &str,
        file_name: &str,
        png: Vec<u8>,
        variant: SkinVariant,
    ) -> Result<()> {
        let url = child_url(&self.config.endpoints.mc_profile, &["skins"])?;
        let file = reqwest::multipart::Part::bytes(png)
            .file_name(file_name.to_string())
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .text("variant", variant.as_str())
            .part("file", file);

        let response = self
            .http
            .post(url)
            .bearer_auth(mc_access_token)
            .multipart(form)
            .send()
            .await?;

        ensure_success(response).await?;
        Ok(())
    }

    /// Show the cape with `cape_id`
    #[instrument(skip(self, mc_access_token))]
    pub async fn change_cape(&self, mc_access_token: &str, cape_id: &str) -> Result<()> {
        let url = child_url(&self.config.endpoints.mc_profile, &["capes", "active"])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(mc_access_token)
            .json(&serde_json::json!({ "capeId": cape_id }))
            .send()
            .await?;

        ensure_success(response).await?;
        Ok(())
    }

    #[instrument(skip(self, mc_access_token))]
    pub async fn hide_cape(&self, mc_access_token: &str) -> Result<()> {
        let url = child_url(&self.config.endpoints.mc_profile, &["capes", "active"])?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(mc_access_token)
            .send()
            .await?;

        ensure_success(response).await?;
        Ok(())
    }

    /// Resolve a player name to its UUID; `None` when no such player exists
    #[instrument(skip(self))]
    pub async fn lookup_uuid(&self, name: &str) -> Result<Option<PlayerUuid>> {
        let url = child_url(&self.config.endpoints.mojang_profiles, &[name])?;
        let response = self.http.get(url).send().await?;

        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::NO_CONTENT) {
            return Ok(None);
        }

        read_json(ensure_success(response).await?).await.map(Some)
    }

    /// Fetch and decode the public skin/cape textures of a player
    #[instrument(skip(self))]
    pub async fn fetch_textures(&self, uuid: &str) -> Result<Option<TexturesPayload>> {
        let url = child_url(&self.config.endpoints.session_profile, &[uuid])?;
        let response = self.http.get(url).send().await?;

        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::NO_CONTENT) {
            return Ok(None);
        }

        let profile: SessionProfile = read_json(ensure_success(response).await?).await?;
        let Some(property) = profile.properties.into_iter().find(|p| p.name == "textures") else {
            return Ok(None);
        };

        let decoded = STANDARD.decode(property.value.as_bytes()).map_err(|e| {
            AuthError::InvalidResponse(format!("textures property is not base64: {}", e))
        })?;
        Ok(Some(serde_json::from_slice(&decoded)?))
    }
}

/// Map any non-2xx response to [`AuthError::Http`] carrying the status and body
async fn ensure_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    Err(http_error(response).await)
}

async fn http_error(response: Response) -> AuthError {
    let status = response.status();
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    warn!("Request to {} failed with HTTP {}", url, status);
    AuthError::http(status, body)
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

fn child_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AuthError::Config(format!("{} cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
