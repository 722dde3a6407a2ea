//! Server-to-server calls to the identity provider.
//!
//! Handles the authorization code exchange, the refresh token grant and the
//! identity lookup. Every request is bounded by the client timeout.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::provider::OAuthProviderConfig;
use crate::credentials::Environment;
use crate::error::{BrokerError, Result};

/// Token endpoint response.
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub instance_url: Option<String>,
    /// Identity URL
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Identity endpoint response (fields we consume).
#[derive(Debug, Deserialize)]
pub struct Identity {
    pub organization_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Result of a refresh token grant.
pub struct RefreshedTokens {
    pub access_token: String,
    /// Present only when the provider rotated the refresh token
    pub refresh_token: Option<String>,
}

/// HTTP client for the provider's token and identity endpoints.
pub struct ProviderClient {
    http: Client,
    config: OAuthProviderConfig,
}

impl ProviderClient {
    pub fn new(config: OAuthProviderConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("crm-broker/0.1")
            .build()
            .map_err(|e| BrokerError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &OAuthProviderConfig {
        &self.config
    }

    /// Exchange an authorization code for tokens.
    ///
    /// A non-success response fails with [`BrokerError::TokenExchangeFailed`]
    /// carrying the provider's body verbatim.
    pub async fn exchange_code(
        &self,
        environment: Environment,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse> {
        let token_url = self.config.token_url(environment);

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        debug!(environment = %environment, "Exchanging authorization code for token at {}", token_url);

        let response = self
            .http
            .post(&token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BrokerError::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }

        let token_response: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| BrokerError::InvalidResponse(format!("token response: {}", e)))?;

        debug!(
            environment = %environment,
            has_refresh_token = token_response.refresh_token.is_some(),
            token_type = ?token_response.token_type,
            "Token exchange successful"
        );

        Ok(token_response)
    }

    /// Obtain a new access token with the refresh token grant.
    pub async fn refresh(
        &self,
        environment: Environment,
        refresh_token: &str,
    ) -> Result<RefreshedTokens> {
        let token_url = self.config.token_url(environment);

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BrokerError::RefreshFailed {
                status: status.as_u16(),
                body,
            });
        }

        let token_response: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| BrokerError::InvalidResponse(format!("refresh response: {}", e)))?;

        Ok(RefreshedTokens {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
        })
    }

    /// Look up the tenant behind an access token.
    pub async fn fetch_identity(&self, identity_url: &str, access_token: &str) -> Result<Identity> {
        let response = self
            .http
            .get(identity_url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BrokerError::IdentityLookupFailed {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| BrokerError::InvalidResponse(format!("identity response: {}", e)))
    }
}
