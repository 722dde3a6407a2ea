//! Error taxonomy for the credential broker.
//!
//! Provider-side failures carry the provider's status and body so callers can
//! diagnose them. Tokens, secrets and authorization codes never appear in any
//! variant.

use thiserror::Error;

/// Errors produced by the vault, the authorization flow and the call executor.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Callback `state` is unknown, already consumed, or past its TTL.
    #[error("Invalid or expired OAuth state")]
    InvalidOrExpiredState,

    /// The user declined, or the provider rejected the authorization request.
    #[error("Provider denied authorization: {error} - {description}")]
    ProviderDenied { error: String, description: String },

    /// A required callback/query parameter was not supplied.
    #[error("Missing '{0}' parameter")]
    MissingParameter(&'static str),

    /// Token endpoint rejected the authorization code exchange.
    #[error("Token exchange failed with status {status}: {body}")]
    TokenExchangeFailed { status: u16, body: String },

    /// Token endpoint rejected the refresh token grant.
    #[error("Token refresh failed with status {status}: {body}")]
    RefreshFailed { status: u16, body: String },

    /// Identity endpoint did not return the caller's identity.
    #[error("Identity lookup failed with status {status}: {body}")]
    IdentityLookupFailed { status: u16, body: String },

    /// Sealed credentials failed authentication (tampered, wrong key or wrong record).
    #[error("Stored credentials failed integrity check")]
    Integrity,

    /// API path resolves outside the versioned data API.
    #[error("Invalid API path '{0}'")]
    InvalidPath(String),

    /// No stored connection for this user and environment.
    #[error("Not connected. Authorize this environment first.")]
    NotConnected,

    /// Missing or blank required configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network failure or timeout talking to the provider.
    #[error("Provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Provider answered with a body we could not interpret.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// Storage backend failure.
    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl BrokerError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::InvalidOrExpiredState => "INVALID_STATE",
            BrokerError::ProviderDenied { .. } => "PROVIDER_DENIED",
            BrokerError::MissingParameter(_) => "MISSING_PARAMETER",
            BrokerError::TokenExchangeFailed { .. } => "TOKEN_EXCHANGE_FAILED",
            BrokerError::RefreshFailed { .. } => "REFRESH_FAILED",
            BrokerError::IdentityLookupFailed { .. } => "IDENTITY_LOOKUP_FAILED",
            BrokerError::Integrity => "INTEGRITY_ERROR",
            BrokerError::InvalidPath(_) => "INVALID_PATH",
            BrokerError::NotConnected => "NOT_CONNECTED",
            BrokerError::Configuration(_) => "CONFIGURATION_ERROR",
            BrokerError::Transport(_) => "PROVIDER_UNAVAILABLE",
            BrokerError::InvalidResponse(_) => "INVALID_PROVIDER_RESPONSE",
            BrokerError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
