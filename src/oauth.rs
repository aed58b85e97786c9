use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::error::{AppError, AppResult};

/// Profile facts the platform consumes from the OAuth provider. Only
/// verified emails ever reach callers.
#[derive(Debug, Clone)]
pub struct VerifiedProfile {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

pub struct GoogleOAuth {
    client: reqwest::Client,
    token_endpoint: String,
    userinfo_endpoint: String,
    client_id: String,
    client_secret: String,
    redirect_url: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct UserInfo {
    email: String,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    given_name: String,
    #[serde(default)]
    family_name: String,
}

impl GoogleOAuth {
    pub fn from_config() -> Arc<Self> {
        Self::new(
            config::GOOGLE_OAUTH_TOKEN_ENDPOINT.clone(),
            config::GOOGLE_OAUTH_USERINFO_ENDPOINT.clone(),
            config::GOOGLE_OAUTH_CLIENT_ID.clone(),
            config::GOOGLE_OAUTH_CLIENT_SECRET.clone(),
            config::GOOGLE_OAUTH_REDIRECT_URL.clone(),
        )
    }

    pub fn new(
        token_endpoint: String,
        userinfo_endpoint: String,
        client_id: String,
        client_secret: String,
        redirect_url: String,
    ) -> Arc<Self> {
        Arc::new(GoogleOAuth {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client build"),
            token_endpoint,
            userinfo_endpoint,
            client_id,
            client_secret,
            redirect_url,
        })
    }

    /// Exchanges an authorization code for a verified email and profile.
    pub async fn exchange(&self, code: &str) -> AppResult<VerifiedProfile> {
        if self.client_id.is_empty() {
            return Err(AppError::Message("google oauth is not configured".into()));
        }
        let token: TokenResponse = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .map_err(upstream)?;

        let info: UserInfo = self
            .client
            .get(&self.userinfo_endpoint)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .map_err(upstream)?;

        if !info.email_verified {
            return Err(AppError::Unauthorized);
        }
        Ok(VerifiedProfile {
            email: info.email.trim().to_lowercase(),
            first_name: info.given_name,
            last_name: info.family_name,
        })
    }
}

fn upstream(e: reqwest::Error) -> AppError {
    tracing::error!(?e, "oauth provider call failed");
    AppError::Upstream {
        provider: "oauth",
        status: e.status().map(|s| s.as_u16()),
        cause: e.to_string(),
    }
}
