// Configuration (TOML + BROKER_* environment)
pub mod config;

// Error taxonomy
pub mod error;

// Encrypted connection vault
pub mod credentials;

// Authorization code flow, PKCE, token refresh
pub mod oauth;

// Authenticated CRM API calls
pub mod executor;

// Caller identity
pub mod auth;

// HTTP API
pub mod api;
