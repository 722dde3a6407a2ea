//! One-time authorization state for CSRF protection and PKCE.
//!
//! Each `state` maps to the flow that created it. Consumption removes the
//! entry in the same step as the lookup, so a replayed callback can never
//! succeed twice.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use super::provider;
use crate::credentials::Environment;
use crate::error::Result;

/// A started, not yet completed authorization attempt.
#[derive(Clone)]
pub struct PendingAuthorization {
    pub state: String,
    pub environment: Environment,
    pub user_key: String,
    /// PKCE verifier; `None` when proof-key protection is disabled.
    pub code_verifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("state", &self.state)
            .field("environment", &self.environment)
            .field("user_key", &self.user_key)
            .field("code_verifier", &self.code_verifier.as_ref().map(|_| "<redacted>"))
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Keyed store of pending authorizations.
///
/// `take` must look up and delete as one atomic step.
pub trait PendingStore: Send + Sync {
    fn insert(&self, pending: PendingAuthorization) -> Result<()>;
    fn take(&self, state: &str) -> Result<Option<PendingAuthorization>>;
    /// Drops entries created before `cutoff`; returns how many were removed.
    fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
    fn len(&self) -> Result<usize>;
}

/// In-memory pending store.
#[derive(Default)]
pub struct MemoryPendingStore {
    entries: DashMap<String, PendingAuthorization>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingStore for MemoryPendingStore {
    fn insert(&self, pending: PendingAuthorization) -> Result<()> {
        self.entries.insert(pending.state.clone(), pending);
        Ok(())
    }

    fn take(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        Ok(self.entries.remove(state).map(|(_, pending)| pending))
    }

    fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, pending| pending.created_at >= cutoff);
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.len())
    }
}

/// Pending authorization manager with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn PendingStore>,
    expiry_duration: Duration,
}

impl StateManager {
    /// Create a state manager backed by process memory
    ///
    /// # Arguments
    /// * `expiry_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(expiry_seconds: i64) -> Self {
        Self::with_store(Arc::new(MemoryPendingStore::new()), expiry_seconds)
    }

    pub fn with_store(store: Arc<dyn PendingStore>, expiry_seconds: i64) -> Self {
        Self {
            store,
            expiry_duration: Duration::seconds(expiry_seconds),
        }
    }

    /// Generate a fresh state (and PKCE verifier when `pkce` is set) and store it
    pub fn create_state(
        &self,
        user_key: &str,
        environment: Environment,
        pkce: bool,
    ) -> Result<PendingAuthorization> {
        let pending = PendingAuthorization {
            state: provider::generate_state(),
            environment,
            user_key: user_key.to_string(),
            code_verifier: pkce.then(provider::generate_code_verifier),
            created_at: Utc::now(),
        };

        self.store.insert(pending.clone())?;
        Ok(pending)
    }

    /// Validate and consume a state token
    ///
    /// Returns the entry if present and not expired. The entry is removed
    /// either way (single-use).
    pub fn validate_and_consume(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        let Some(pending) = self.store.take(state)? else {
            return Ok(None);
        };

        if Utc::now() - pending.created_at > self.expiry_duration {
            return Ok(None);
        }

        Ok(Some(pending))
    }

    /// Drop states older than the expiry window
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.store
            .purge_created_before(Utc::now() - self.expiry_duration)
    }

    /// Number of outstanding states (for debugging/monitoring)
    pub fn count(&self) -> Result<usize> {
        self.store.len()
    }
}

/// Background task to periodically clean up expired states
///
/// An interval of zero is treated as one second.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        match manager.cleanup_expired() {
            Ok(removed) => tracing::debug!(
                removed,
                remaining = manager.count().unwrap_or_default(),
                "OAuth state cleanup complete"
            ),
            Err(e) => tracing::warn!(error = %e, "OAuth state cleanup failed"),
        }
    }
}
