use serde::Deserialize;
use std::fmt;

use crate::error::{BrokerError, Result};

/// Complete broker configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Connected-app registration and authorization flow settings
#[derive(Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Public base URL of this service, e.g. `https://broker.example.com`
    #[serde(default)]
    pub callback_base_url: String,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_pkce_enabled")]
    pub pkce_enabled: bool,
    #[serde(default = "default_production_login_url")]
    pub production_login_url: String,
    #[serde(default = "default_sandbox_login_url")]
    pub sandbox_login_url: String,
    /// How long a started authorization may wait for its callback
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
}

fn default_callback_path() -> String {
    "/oauth/callback".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "api".to_string(),
        "refresh_token".to_string(),
    ]
}

fn default_pkce_enabled() -> bool {
    true
}

fn default_production_login_url() -> String {
    "https://login.salesforce.com".to_string()
}

fn default_sandbox_login_url() -> String {
    "https://test.salesforce.com".to_string()
}

fn default_state_ttl() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            callback_base_url: String::new(),
            callback_path: default_callback_path(),
            scopes: default_scopes(),
            pkce_enabled: default_pkce_enabled(),
            production_login_url: default_production_login_url(),
            sandbox_login_url: default_sandbox_login_url(),
            state_ttl_seconds: default_state_ttl(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
        }
    }
}

impl OAuthConfig {
    /// Route the callback is served on, with a single leading `/`.
    pub fn callback_route(&self) -> String {
        normalize_route(&self.callback_path)
    }

    /// Redirect URI registered with the provider.
    pub fn redirect_uri(&self) -> String {
        format!(
            "{}{}",
            self.callback_base_url.trim_end_matches('/'),
            self.callback_route()
        )
    }
}

/// `oauth/callback`, `/oauth/callback` and `//oauth/callback` all become
/// `/oauth/callback`.
pub fn normalize_route(path: &str) -> String {
    format!("/{}", path.trim().trim_start_matches('/'))
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("callback_base_url", &self.callback_base_url)
            .field("callback_path", &self.callback_path)
            .field("scopes", &self.scopes)
            .field("pkce_enabled", &self.pkce_enabled)
            .field("production_login_url", &self.production_login_url)
            .field("sandbox_login_url", &self.sandbox_login_url)
            .field("state_ttl_seconds", &self.state_ttl_seconds)
            .field(
                "state_cleanup_interval_seconds",
                &self.state_cleanup_interval_seconds,
            )
            .finish()
    }
}

/// Credential vault settings
#[derive(Clone, Default, Deserialize)]
pub struct VaultConfig {
    /// Process-wide master secret the vault key is derived from
    #[serde(default)]
    pub master_secret: String,
    /// SQLite database path; in-memory storage when unset
    #[serde(default)]
    pub credentials_db: Option<String>,
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("master_secret", &"<redacted>")
            .field("credentials_db", &self.credentials_db)
            .finish()
    }
}

/// CRM API call settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Versioned REST prefix under `/services/data/`
    #[serde(default = "default_api_version")]
    pub version: String,
    /// Timeout for every outbound provider call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_api_version() -> String {
    "v59.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            version: default_api_version(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Browser origins allowed to call the API; empty disables CORS
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Override fields from `BROKER_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Override fields from any variable source. Unparseable numeric and
    /// boolean values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BROKER_CLIENT_ID") {
            self.oauth.client_id = v;
        }
        if let Some(v) = lookup("BROKER_CLIENT_SECRET") {
            self.oauth.client_secret = v;
        }
        if let Some(v) = lookup("BROKER_BASE_URL") {
            self.oauth.callback_base_url = v;
        }
        if let Some(v) = lookup("BROKER_CALLBACK_PATH") {
            self.oauth.callback_path = v;
        }
        if let Some(v) = lookup("BROKER_SCOPES") {
            self.oauth.scopes = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(b) = lookup("BROKER_PKCE_ENABLED").and_then(|v| v.parse::<bool>().ok()) {
            self.oauth.pkce_enabled = b;
        }
        if let Some(n) = lookup("BROKER_STATE_TTL_SECONDS").and_then(|v| v.parse::<i64>().ok()) {
            self.oauth.state_ttl_seconds = n;
        }
        if let Some(n) =
            lookup("BROKER_STATE_CLEANUP_INTERVAL_SECONDS").and_then(|v| v.parse::<u64>().ok())
        {
            self.oauth.state_cleanup_interval_seconds = n;
        }
        if let Some(v) = lookup("BROKER_MASTER_SECRET") {
            self.vault.master_secret = v;
        }
        if let Some(v) = lookup("BROKER_CREDENTIALS_DB") {
            self.vault.credentials_db = Some(v);
        }
        if let Some(v) = lookup("BROKER_API_VERSION") {
            self.api.version = v;
        }
        if let Some(n) =
            lookup("BROKER_REQUEST_TIMEOUT_SECONDS").and_then(|v| v.parse::<u64>().ok())
        {
            self.api.request_timeout_seconds = n;
        }
        if let Some(n) = lookup("BROKER_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.port = n;
        }
        if let Some(v) = lookup("BROKER_CORS_ORIGINS") {
            self.server.cors_allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Fail fast when a required value is blank. Formats are not checked.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("vault.master_secret", &self.vault.master_secret),
            ("oauth.client_id", &self.oauth.client_id),
            ("oauth.client_secret", &self.oauth.client_secret),
            ("oauth.callback_base_url", &self.oauth.callback_base_url),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(BrokerError::Configuration(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        if self.oauth.state_ttl_seconds <= 0 {
            return Err(BrokerError::Configuration(
                "oauth.state_ttl_seconds must be positive".to_string(),
            ));
        }

        if self.api.request_timeout_seconds == 0 {
            return Err(BrokerError::Configuration(
                "api.request_timeout_seconds must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<BrokerConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| BrokerError::Configuration(format!("Failed to read {}: {}", path, e)))?;
    toml::from_str(&contents)
        .map_err(|e| BrokerError::Configuration(format!("Failed to parse {}: {}", path, e)))
}
