//! Token contract for the upstream OAuth endpoint.
//!
//! Both the authorization-code exchange and the refresh flow post form data to a
//! single endpoint. The client secret is never sent as-is: it is masked as
//! `base64(sha256(secret + lowercase(trim(client_id))))`.

use crate::config::OAuthConfig;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Bearer credential for upstream data calls.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        AccessToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Token {
    pub fn access(&self) -> AccessToken {
        AccessToken::new(self.access_token.clone())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint rejected the request with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("authorization code exchange requires a redirect_uri")]
    MissingRedirectUri,
}

pub fn mask_secret(secret: &str, client_id: &str) -> String {
    let normalized_id = client_id.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(normalized_id.as_bytes());
    STANDARD.encode(hasher.finalize())
}

pub struct TokenClient {
    client: reqwest::Client,
    config: OAuthConfig,
    masked_secret: String,
}

impl TokenClient {
    pub fn new(client: reqwest::Client, config: OAuthConfig) -> Self {
        let masked_secret = mask_secret(&config.client_secret, &config.client_id);
        TokenClient {
            client,
            config,
            masked_secret,
        }
    }

    pub async fn exchange_code(&self, code: &str) -> Result<Token, TokenError> {
        let redirect_uri = self
            .config
            .redirect_uri
            .as_deref()
            .ok_or(TokenError::MissingRedirectUri)?;

        self.request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.masked_secret),
        ])
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Token, TokenError> {
        self.request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.masked_secret),
        ])
        .await
    }

    async fn request(&self, form: &[(&str, &str)]) -> Result<Token, TokenError> {
        let response = self
            .client
            .post(self.config.token_url.clone())
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "token request rejected");
            return Err(TokenError::Rejected { status, body });
        }

        Ok(response.json::<Token>().await?)
    }
}
