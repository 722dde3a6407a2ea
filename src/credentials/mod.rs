//! Encrypted connection vault for CRM OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       ConnectionRegistry                 │
//! │  - put / get / revoke / rotate           │
//! │  - per-key mutual exclusion              │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!      (seal)               (unseal)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretStore                        │
//! │  - AES-256-GCM, key = SHA-256(secret)    │
//! │  - fresh nonce per seal                  │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       ConnectionStore                    │
//! │  - in-memory (DashMap) or SQLite         │
//! │  - only sealed envelopes at rest         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use crm_broker::credentials::{
//!     ConnectionFields, ConnectionKey, ConnectionRegistry, Environment, MemoryConnectionStore,
//!     SecretStore, TokenPair,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> crm_broker::error::Result<()> {
//! let secrets = SecretStore::new("master-secret")?;
//! let registry = ConnectionRegistry::new(Arc::new(MemoryConnectionStore::new()), secrets);
//!
//! let key = ConnectionKey::new("user1", Environment::Sandbox);
//! registry.put(
//!     &key,
//!     ConnectionFields {
//!         instance_url: "https://acme.my.salesforce.com".to_string(),
//!         identity_url: "https://test.salesforce.com/id/00D/005".to_string(),
//!         org_id: "00D000000000001".to_string(),
//!         tokens: TokenPair {
//!             access_token: "access".to_string(),
//!             refresh_token: "refresh".to_string(),
//!         },
//!     },
//! )?;
//!
//! if let Some(connection) = registry.get(&key)? {
//!     println!("Connected to org {}", connection.org_id);
//! }
//!
//! registry.revoke(&key)?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod encryption;
mod registry;
mod storage;

pub use encryption::{EncryptedEnvelope, SecretStore, NONCE_SIZE, TAG_SIZE};
pub use registry::{ConnectionRegistry, RotateOutcome};
pub use storage::{ConnectionStore, MemoryConnectionStore, SqliteConnectionStore, StoredConnection};

/// CRM environment a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[serde(alias = "prod")]
    Production,
    Sandbox,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "sandbox" => Ok(Environment::Sandbox),
            other => Err(format!("Unknown environment '{}'", other)),
        }
    }
}

/// Composite key of a connection: one record per user and environment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user_key: String,
    pub environment: Environment,
}

impl ConnectionKey {
    pub fn new(user_key: impl Into<String>, environment: Environment) -> Self {
        Self {
            user_key: user_key.into(),
            environment,
        }
    }

    /// Associated data binding a sealed envelope to this key.
    pub fn associated_data(&self) -> Vec<u8> {
        format!("{}:{}", self.user_key, self.environment).into_bytes()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_key, self.environment)
    }
}

/// The confidential half of a connection. Only ever at rest inside an
/// [`EncryptedEnvelope`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Everything needed to write a connection.
#[derive(Clone, Debug)]
pub struct ConnectionFields {
    pub instance_url: String,
    pub identity_url: String,
    pub org_id: String,
    pub tokens: TokenPair,
}

/// A decrypted connection, borrowed out of the registry for one call.
#[derive(Clone)]
pub struct Connection {
    pub user_key: String,
    pub environment: Environment,
    pub instance_url: String,
    pub identity_url: String,
    pub org_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.user_key.clone(), self.environment)
    }

    /// Public view of the connection, safe to return to callers.
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            environment: self.environment,
            instance_url: self.instance_url.clone(),
            org_id: self.org_id.clone(),
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("user_key", &self.user_key)
            .field("environment", &self.environment)
            .field("instance_url", &self.instance_url)
            .field("identity_url", &self.identity_url)
            .field("org_id", &self.org_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Token-free description of a connection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSummary {
    pub environment: Environment,
    pub instance_url: String,
    pub org_id: String,
    pub updated_at: DateTime<Utc>,
}
