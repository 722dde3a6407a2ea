//! OAuth 2.0 authorization code flow with PKCE.
//!
//! 1. `start` records a one-time state (and PKCE verifier) and returns the
//!    provider's authorization URL
//! 2. User authorizes on the provider's site
//! 3. Provider redirects back with `code` and `state`
//! 4. `complete_callback` consumes the state, exchanges the code for tokens,
//!    looks up the tenant and stores the sealed connection
//!
//! `refresh` is the refresh token grant used by the call executor.

mod exchange;
mod provider;
mod state_manager;

pub use exchange::{Identity, ProviderClient, RefreshedTokens, TokenResponse};
pub use provider::{code_challenge, generate_code_verifier, generate_state, OAuthProviderConfig};
pub use state_manager::{
    run_state_cleanup, MemoryPendingStore, PendingAuthorization, PendingStore, StateManager,
};

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::{
    Connection, ConnectionFields, ConnectionKey, ConnectionRegistry, Environment, TokenPair,
};
use crate::error::{BrokerError, Result};

/// OAuth callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Drives authorization attempts from start to a stored connection.
pub struct AuthorizationFlow {
    provider: Arc<ProviderClient>,
    states: StateManager,
    registry: Arc<ConnectionRegistry>,
}

impl AuthorizationFlow {
    pub fn new(
        provider: Arc<ProviderClient>,
        states: StateManager,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            provider,
            states,
            registry,
        }
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    /// Begin an authorization attempt for `user_key` and return the URL the
    /// user must visit.
    pub fn start(&self, user_key: &str, environment: Environment) -> Result<String> {
        let config = self.provider.config();
        let pending = self
            .states
            .create_state(user_key, environment, config.pkce_enabled)?;

        let challenge = pending.code_verifier.as_deref().map(code_challenge);
        let url = config.build_auth_url(environment, &pending.state, challenge.as_deref());

        info!(
            user_key = %user_key,
            environment = %environment,
            pkce = challenge.is_some(),
            "Authorization flow started"
        );

        Ok(url)
    }

    /// Resolve the provider's redirect back to us.
    pub async fn complete_callback(&self, params: CallbackParams) -> Result<Connection> {
        if let Some(error) = params.error {
            let description = params.error_description.unwrap_or_default();
            warn!(error = %error, description = %description, "OAuth authorization denied");
            return Err(BrokerError::ProviderDenied { error, description });
        }

        let state = params.state.ok_or(BrokerError::InvalidOrExpiredState)?;
        let code = params.code.ok_or(BrokerError::MissingParameter("code"))?;

        let pending = self.states.validate_and_consume(&state)?.ok_or_else(|| {
            warn!(state = %state, "Invalid or expired OAuth state");
            BrokerError::InvalidOrExpiredState
        })?;

        let environment = pending.environment;
        let key = ConnectionKey::new(pending.user_key.clone(), environment);

        debug!(user_key = %key.user_key, environment = %environment, "OAuth state validated");

        let tokens = self
            .provider
            .exchange_code(environment, &code, pending.code_verifier.as_deref())
            .await
            .map_err(|e| {
                warn!(user_key = %key.user_key, environment = %environment, error = %e, "Token exchange failed");
                e
            })?;

        let refresh_token = tokens.refresh_token.ok_or_else(|| {
            BrokerError::InvalidResponse(
                "token response has no refresh_token (is the refresh_token scope granted?)"
                    .to_string(),
            )
        })?;
        let instance_url = tokens.instance_url.ok_or_else(|| {
            BrokerError::InvalidResponse("token response has no instance_url".to_string())
        })?;
        let identity_url = tokens.id.ok_or_else(|| {
            BrokerError::InvalidResponse("token response has no identity url".to_string())
        })?;

        let identity = self
            .provider
            .fetch_identity(&identity_url, &tokens.access_token)
            .await?;

        let connection = self.registry.put(
            &key,
            ConnectionFields {
                instance_url,
                identity_url,
                org_id: identity.organization_id,
                tokens: TokenPair {
                    access_token: tokens.access_token,
                    refresh_token,
                },
            },
        )?;

        info!(
            user_key = %key.user_key,
            environment = %environment,
            org_id = %connection.org_id,
            "OAuth flow completed successfully"
        );

        Ok(connection)
    }

    /// Refresh token grant against the environment's token endpoint.
    pub async fn refresh(
        &self,
        environment: Environment,
        refresh_token: &str,
    ) -> Result<RefreshedTokens> {
        self.provider.refresh(environment, refresh_token).await
    }
}
