//! Keyed storage backends for sealed connection records.
//!
//! Backends only ever see [`StoredConnection`]s, whose tokens are already
//! sealed. Swapping the backend never touches flow logic.

use anyhow::{anyhow, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{ConnectionKey, EncryptedEnvelope, Environment};
use crate::error::{BrokerError, Result};

/// A connection as it exists at rest.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredConnection {
    pub user_key: String,
    pub environment: Environment,
    pub instance_url: String,
    pub identity_url: String,
    pub org_id: String,
    pub envelope: EncryptedEnvelope,
    pub updated_at: DateTime<Utc>,
}

impl StoredConnection {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.user_key.clone(), self.environment)
    }
}

/// Abstract keyed store of sealed connections.
///
/// `save` overwrites any existing record with the same key. `remove` is
/// idempotent and reports whether a record existed.
pub trait ConnectionStore: Send + Sync {
    fn load(&self, key: &ConnectionKey) -> Result<Option<StoredConnection>>;
    fn save(&self, record: StoredConnection) -> Result<()>;
    fn remove(&self, key: &ConnectionKey) -> Result<bool>;
    fn list_by_user(&self, user_key: &str) -> Result<Vec<Environment>>;
}

/// Process-local store. State is lost on restart.
#[derive(Default)]
pub struct MemoryConnectionStore {
    records: DashMap<ConnectionKey, StoredConnection>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionStore for MemoryConnectionStore {
    fn load(&self, key: &ConnectionKey) -> Result<Option<StoredConnection>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    fn save(&self, record: StoredConnection) -> Result<()> {
        self.records.insert(record.key(), record);
        Ok(())
    }

    fn remove(&self, key: &ConnectionKey) -> Result<bool> {
        Ok(self.records.remove(key).is_some())
    }

    fn list_by_user(&self, user_key: &str) -> Result<Vec<Environment>> {
        let mut environments: Vec<Environment> = self
            .records
            .iter()
            .filter(|r| r.key().user_key == user_key)
            .map(|r| r.key().environment)
            .collect();
        environments.sort_by_key(|e| e.as_str());
        Ok(environments)
    }
}

/// Sealed connection storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE connections (
///     id INTEGER PRIMARY KEY,
///     user_key TEXT NOT NULL,
///     environment TEXT NOT NULL,
///     instance_url TEXT NOT NULL,
///     identity_url TEXT NOT NULL,
///     org_id TEXT NOT NULL,
///     ciphertext TEXT NOT NULL,   -- base64, sealed {accessToken, refreshToken}
///     nonce TEXT NOT NULL,        -- base64, 12 bytes
///     auth_tag TEXT NOT NULL,     -- base64, 16 bytes
///     updated_at TEXT NOT NULL,   -- RFC 3339, nanosecond precision
///     UNIQUE(user_key, environment)
/// );
/// ```
pub struct SqliteConnectionStore {
    conn: Mutex<Connection>,
}

impl SqliteConnectionStore {
    /// Creates or opens a connection store at `db_path` (`":memory:"` for tests).
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)
            .context("Failed to open connections database")
            .map_err(BrokerError::Storage)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY,
                user_key TEXT NOT NULL,
                environment TEXT NOT NULL,
                instance_url TEXT NOT NULL,
                identity_url TEXT NOT NULL,
                org_id TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                nonce TEXT NOT NULL,
                auth_tag TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_key, environment)
            );
            CREATE INDEX IF NOT EXISTS idx_connections_user ON connections(user_key);
            "#,
        )
        .context("Failed to create connections table")
        .map_err(BrokerError::Storage)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BrokerError::Storage(anyhow!("connections database lock poisoned")))
    }
}

fn read_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<[String; 7]> {
    Ok([
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ])
}

impl ConnectionStore for SqliteConnectionStore {
    fn load(&self, key: &ConnectionKey) -> Result<Option<StoredConnection>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT instance_url, identity_url, org_id,
                       ciphertext, nonce, auth_tag, updated_at
                FROM connections
                WHERE user_key = ?1 AND environment = ?2
                "#,
            )
            .context("Failed to prepare query")
            .map_err(BrokerError::Storage)?;

        let mut rows = stmt
            .query(params![key.user_key, key.environment.as_str()])
            .context("Failed to execute query")
            .map_err(BrokerError::Storage)?;

        let Some(row) = rows
            .next()
            .context("Failed to read row")
            .map_err(BrokerError::Storage)?
        else {
            return Ok(None);
        };

        let columns = read_columns(row)
            .context("Failed to read connection columns")
            .map_err(BrokerError::Storage)?;
        let [instance_url, identity_url, org_id, ciphertext, nonce, auth_tag, updated_at] =
            columns;

        let envelope = EncryptedEnvelope::from_base64(&ciphertext, &nonce, &auth_tag)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Failed to parse updated_at timestamp")
            .map_err(BrokerError::Storage)?;

        Ok(Some(StoredConnection {
            user_key: key.user_key.clone(),
            environment: key.environment,
            instance_url,
            identity_url,
            org_id,
            envelope,
            updated_at,
        }))
    }

    fn save(&self, record: StoredConnection) -> Result<()> {
        let (ciphertext, nonce, auth_tag) = record.envelope.to_base64();
        let updated_at = record
            .updated_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true);

        self.conn()?
            .execute(
                r#"
                INSERT INTO connections (
                    user_key, environment,
                    instance_url, identity_url, org_id,
                    ciphertext, nonce, auth_tag, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(user_key, environment) DO UPDATE SET
                    instance_url = excluded.instance_url,
                    identity_url = excluded.identity_url,
                    org_id = excluded.org_id,
                    ciphertext = excluded.ciphertext,
                    nonce = excluded.nonce,
                    auth_tag = excluded.auth_tag,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.user_key,
                    record.environment.as_str(),
                    record.instance_url,
                    record.identity_url,
                    record.org_id,
                    ciphertext,
                    nonce,
                    auth_tag,
                    updated_at,
                ],
            )
            .context("Failed to store connection")
            .map_err(BrokerError::Storage)?;

        Ok(())
    }

    fn remove(&self, key: &ConnectionKey) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute(
                "DELETE FROM connections WHERE user_key = ?1 AND environment = ?2",
                params![key.user_key, key.environment.as_str()],
            )
            .context("Failed to delete connection")
            .map_err(BrokerError::Storage)?;

        Ok(rows_affected > 0)
    }

    fn list_by_user(&self, user_key: &str) -> Result<Vec<Environment>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT environment FROM connections WHERE user_key = ?1 ORDER BY environment")
            .context("Failed to prepare query")
            .map_err(BrokerError::Storage)?;

        let names = stmt
            .query_map(params![user_key], |row| row.get::<_, String>(0))
            .context("Failed to execute query")
            .map_err(BrokerError::Storage)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("Failed to read results")
            .map_err(BrokerError::Storage)?;

        names
            .iter()
            .map(|name| {
                name.parse::<Environment>()
                    .map_err(|e| BrokerError::Storage(anyhow!(e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_key: &str, environment: Environment, org_id: &str) -> StoredConnection {
        StoredConnection {
            user_key: user_key.to_string(),
            environment,
            instance_url: "https://acme.my.salesforce.com".to_string(),
            identity_url: "https://login.salesforce.com/id/00D/005".to_string(),
            org_id: org_id.to_string(),
            envelope: EncryptedEnvelope {
                ciphertext: vec![1, 2, 3, 4],
                nonce: [7u8; 12],
                auth_tag: [9u8; 16],
            },
            updated_at: Utc::now(),
        }
    }

    fn backends() -> Vec<Box<dyn ConnectionStore>> {
        vec![
            Box::new(MemoryConnectionStore::new()),
            Box::new(SqliteConnectionStore::new(":memory:").unwrap()),
        ]
    }

    #[test]
    fn test_save_and_load() {
        for store in backends() {
            let original = record("user1", Environment::Sandbox, "00DA");
            store.save(original.clone()).unwrap();

            let loaded = store.load(&original.key()).unwrap().unwrap();
            assert_eq!(loaded, original);
        }
    }

    #[test]
    fn test_load_nonexistent() {
        for store in backends() {
            let key = ConnectionKey::new("user1", Environment::Production);
            assert!(store.load(&key).unwrap().is_none());
        }
    }

    #[test]
    fn test_save_overwrites() {
        for store in backends() {
            store.save(record("user1", Environment::Sandbox, "00DA")).unwrap();
            store.save(record("user1", Environment::Sandbox, "00DB")).unwrap();

            let key = ConnectionKey::new("user1", Environment::Sandbox);
            assert_eq!(store.load(&key).unwrap().unwrap().org_id, "00DB");
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        for store in backends() {
            let original = record("user1", Environment::Sandbox, "00DA");
            store.save(original.clone()).unwrap();

            assert!(store.remove(&original.key()).unwrap());
            assert!(store.load(&original.key()).unwrap().is_none());
            assert!(!store.remove(&original.key()).unwrap());
        }
    }

    #[test]
    fn test_list_by_user() {
        for store in backends() {
            store.save(record("user1", Environment::Sandbox, "00DA")).unwrap();
            store.save(record("user1", Environment::Production, "00DB")).unwrap();
            store.save(record("user2", Environment::Sandbox, "00DC")).unwrap();

            assert_eq!(
                store.list_by_user("user1").unwrap(),
                vec![Environment::Production, Environment::Sandbox]
            );
            assert_eq!(
                store.list_by_user("user2").unwrap(),
                vec![Environment::Sandbox]
            );
            assert!(store.list_by_user("user3").unwrap().is_empty());
        }
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.db");
        let original = record("user1", Environment::Production, "00DA");

        {
            let store = SqliteConnectionStore::new(&path).unwrap();
            store.save(original.clone()).unwrap();
        }

        let reopened = SqliteConnectionStore::new(&path).unwrap();
        let loaded = reopened.load(&original.key()).unwrap().unwrap();
        assert_eq!(loaded.updated_at, original.updated_at);
        assert_eq!(loaded.envelope, original.envelope);
    }
}
