//! One connection per (user, environment), sealed before it reaches storage.

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{
    Connection, ConnectionFields, ConnectionKey, ConnectionStore, Environment, SecretStore,
    StoredConnection, TokenPair,
};
use crate::error::{BrokerError, Result};

/// Result of a compare-and-set access token rotation.
#[derive(Debug)]
pub enum RotateOutcome {
    /// The new token was written.
    Rotated(Connection),
    /// The record changed since it was read; nothing was written. Carries the
    /// current record.
    Superseded(Connection),
    /// The record was revoked in the meantime.
    Missing,
}

/// Owns all connection records.
///
/// Writes to the same key are serialized by a per-key mutex; different keys
/// never contend.
pub struct ConnectionRegistry {
    store: Arc<dyn ConnectionStore>,
    secrets: SecretStore,
    locks: DashMap<ConnectionKey, Arc<Mutex<()>>>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn ConnectionStore>, secrets: SecretStore) -> Self {
        Self {
            store,
            secrets,
            locks: DashMap::new(),
        }
    }

    /// Runs `f` holding the mutex for `key`. The lock entry is dropped again
    /// once no other caller holds or waits on it, so the map only holds keys
    /// that are in use.
    fn with_key_lock<T>(&self, key: &ConnectionKey, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(_) => Err(poisoned(key)),
        };

        drop(lock);
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    /// Stores a connection, replacing any previous one for `key`.
    pub fn put(&self, key: &ConnectionKey, fields: ConnectionFields) -> Result<Connection> {
        self.with_key_lock(key, || {
            let previous = self.store.load(key)?.map(|r| r.updated_at);
            let record = self.seal(key, fields, next_timestamp(previous))?;
            self.store.save(record)?;

            debug!(user_key = %key.user_key, environment = %key.environment, "Connection stored");

            self.read(key)?.ok_or(BrokerError::NotConnected)
        })
    }

    /// Returns the decrypted connection, or `None` when there is none.
    pub fn get(&self, key: &ConnectionKey) -> Result<Option<Connection>> {
        self.read(key)
    }

    /// Deletes the connection. Returns whether one existed.
    pub fn revoke(&self, key: &ConnectionKey) -> Result<bool> {
        self.with_key_lock(key, || {
            let removed = self.store.remove(key)?;
            debug!(
                user_key = %key.user_key,
                environment = %key.environment,
                removed,
                "Connection revoked"
            );
            Ok(removed)
        })
    }

    /// Replaces the access token (and the refresh token, when the provider
    /// rotated it) only if the record is still the one last read at
    /// `expected_updated_at`.
    pub fn rotate_access_token(
        &self,
        key: &ConnectionKey,
        expected_updated_at: DateTime<Utc>,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<RotateOutcome> {
        self.with_key_lock(key, || {
            let Some(current) = self.store.load(key)? else {
                return Ok(RotateOutcome::Missing);
            };

            let current = self.open(current)?;
            if current.updated_at != expected_updated_at {
                debug!(
                    user_key = %key.user_key,
                    environment = %key.environment,
                    "Connection changed since read, skipping token rotation"
                );
                return Ok(RotateOutcome::Superseded(current));
            }

            let fields = ConnectionFields {
                instance_url: current.instance_url,
                identity_url: current.identity_url,
                org_id: current.org_id,
                tokens: TokenPair {
                    access_token,
                    refresh_token: refresh_token.unwrap_or(current.refresh_token),
                },
            };
            let record = self.seal(key, fields, next_timestamp(Some(current.updated_at)))?;
            self.store.save(record)?;

            let rotated = self.read(key)?.ok_or(BrokerError::NotConnected)?;
            Ok(RotateOutcome::Rotated(rotated))
        })
    }

    /// Environments the user has a stored connection for.
    pub fn list_by_user(&self, user_key: &str) -> Result<Vec<Environment>> {
        self.store.list_by_user(user_key)
    }

    fn read(&self, key: &ConnectionKey) -> Result<Option<Connection>> {
        self.store.load(key)?.map(|r| self.open(r)).transpose()
    }

    fn seal(
        &self,
        key: &ConnectionKey,
        fields: ConnectionFields,
        updated_at: DateTime<Utc>,
    ) -> Result<StoredConnection> {
        let envelope = self.secrets.seal(&fields.tokens, &key.associated_data())?;
        Ok(StoredConnection {
            user_key: key.user_key.clone(),
            environment: key.environment,
            instance_url: fields.instance_url,
            identity_url: fields.identity_url,
            org_id: fields.org_id,
            envelope,
            updated_at,
        })
    }

    fn open(&self, record: StoredConnection) -> Result<Connection> {
        let key = record.key();
        let tokens = self
            .secrets
            .unseal(&record.envelope, &key.associated_data())
            .map_err(|e| {
                tracing::error!(
                    user_key = %key.user_key,
                    environment = %key.environment,
                    "Stored credentials failed integrity check"
                );
                e
            })?;

        Ok(Connection {
            user_key: record.user_key,
            environment: record.environment,
            instance_url: record.instance_url,
            identity_url: record.identity_url,
            org_id: record.org_id,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            updated_at: record.updated_at,
        })
    }
}

/// `updated_at` strictly increases per key, so compare-and-set never confuses
/// two writes landing on the same clock tick.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev >= now => prev + Duration::nanoseconds(1),
        _ => now,
    }
}

fn poisoned(key: &ConnectionKey) -> BrokerError {
    BrokerError::Storage(anyhow!("connection lock poisoned for {}", key))
}
