//! Identity provider endpoints and PKCE helpers.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::config::OAuthConfig;
use crate::credentials::Environment;

/// Bytes of entropy in a `state` value
const STATE_BYTES: usize = 16;

/// Bytes of entropy in a PKCE code verifier
const VERIFIER_BYTES: usize = 32;

const AUTHORIZE_PATH: &str = "/services/oauth2/authorize";
const TOKEN_PATH: &str = "/services/oauth2/token";

/// OAuth provider configuration
#[derive(Clone)]
pub struct OAuthProviderConfig {
    pub production_login_url: String,
    pub sandbox_login_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub pkce_enabled: bool,
}

impl std::fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("production_login_url", &self.production_login_url)
            .field("sandbox_login_url", &self.sandbox_login_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("pkce_enabled", &self.pkce_enabled)
            .finish()
    }
}

impl OAuthProviderConfig {
    pub fn from_config(config: &OAuthConfig) -> Self {
        Self {
            production_login_url: config.production_login_url.trim_end_matches('/').to_string(),
            sandbox_login_url: config.sandbox_login_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri(),
            scopes: config.scopes.clone(),
            pkce_enabled: config.pkce_enabled,
        }
    }

    /// Login host for the environment
    pub fn login_url(&self, environment: Environment) -> &str {
        match environment {
            Environment::Production => &self.production_login_url,
            Environment::Sandbox => &self.sandbox_login_url,
        }
    }

    pub fn authorize_url(&self, environment: Environment) -> String {
        format!("{}{}", self.login_url(environment), AUTHORIZE_PATH)
    }

    pub fn token_url(&self, environment: Environment) -> String {
        format!("{}{}", self.login_url(environment), TOKEN_PATH)
    }

    /// Build authorization URL with state, redirect_uri and optional PKCE challenge
    pub fn build_auth_url(
        &self,
        environment: Environment,
        state: &str,
        code_challenge: Option<&str>,
    ) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.authorize_url(environment),
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );

        if let Some(challenge) = code_challenge {
            url.push_str(&format!(
                "&code_challenge={}&code_challenge_method=S256",
                urlencoding::encode(challenge)
            ));
        }

        url
    }
}

/// Random hex-encoded `state` (16 bytes from the OS RNG)
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random base64url code verifier (32 bytes from the OS RNG, 43 characters)
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    OsRng.fill_bytes(&mut bytes);
    BASE64_URL.encode(bytes)
}

/// `S256` challenge: base64url(SHA-256(verifier)) without padding
pub fn code_challenge(code_verifier: &str) -> String {
    BASE64_URL.encode(Sha256::digest(code_verifier.as_bytes()))
}
