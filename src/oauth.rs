use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::GoogleOauthConfig;
use crate::error::{AppError, AppResult};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// key: google-oauth -> auth-url + code exchange
pub struct GoogleOauthClient {
    client: Client,
    config: GoogleOauthConfig,
    token_url: String,
    userinfo_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleIdentity {
    #[serde(rename = "sub")]
    pub subject: String,
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl GoogleOauthClient {
    pub fn new(config: GoogleOauthConfig) -> Self {
        Self::with_endpoints(config, GOOGLE_TOKEN_URL, GOOGLE_USERINFO_URL)
    }

    pub fn with_endpoints(
        config: GoogleOauthConfig,
        token_url: impl Into<String>,
        userinfo_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client build"),
            config,
            token_url: token_url.into(),
            userinfo_url: userinfo_url.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.client_id.is_empty() && !self.config.client_secret.is_empty()
    }

    /// The redirect target a client should open; `state` is the caller's
    /// CSRF nonce.
    pub fn auth_url(&self, state: &str) -> AppResult<String> {
        let mut url = Url::parse(GOOGLE_AUTH_URL)
            .map_err(|err| AppError::Internal(anyhow::anyhow!("auth url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", "openid email profile")
            .append_pair("state", state);
        Ok(url.into())
    }

    /// Exchange an authorization code for the Google identity behind it.
    pub async fn exchange_code(&self, code: &str) -> AppResult<GoogleIdentity> {
        let token: TokenResponse = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .send()
            .await
            .map_err(|err| AppError::external("provider.google", err.to_string()))?
            .error_for_status()
            .map_err(|err| AppError::external("provider.google", err.to_string()))?
            .json()
            .await
            .map_err(|err| AppError::external("provider.google", err.to_string()))?;

        let identity: GoogleIdentity = self
            .client
            .get(&self.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|err| AppError::external("provider.google", err.to_string()))?
            .error_for_status()
            .map_err(|err| AppError::external("provider.google", err.to_string()))?
            .json()
            .await
            .map_err(|err| AppError::external("provider.google", err.to_string()))?;

        Ok(identity)
    }
}
