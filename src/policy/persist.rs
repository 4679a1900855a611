//! Durable policy record.
//!
//! A single-row, single-writer SQLite store: database `api-cache-config`,
//! table `config`, one record under the key `latest` holding the policy JSON
//! and the wall-clock time it was saved. Writes are atomic put-or-replace.

use std::path::Path;

use thiserror::Error;
use tokio_rusqlite::rusqlite;
use tokio_rusqlite::{Connection, params};

use super::CachePolicy;

/// Default file name for the policy database.
pub const POLICY_DB_FILE: &str = "api-cache-config.db";

const LATEST_KEY: &str = "latest";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    policy TEXT NOT NULL,
    saved_at INTEGER NOT NULL
)";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("policy database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("policy database error: {0}")]
    Connect(#[from] rusqlite::Error),
    #[error("persisted policy is not decodable: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A policy record as read back from the database.
#[derive(Debug, Clone)]
pub struct PersistedPolicy {
    pub policy: CachePolicy,
    /// Wall-clock ms when the record was written.
    pub saved_at: u64,
}

/// Handle to the embedded policy database.
#[derive(Clone)]
pub struct PolicyDb {
    conn: Connection,
}

impl PolicyDb {
    /// Open (and create if needed) the policy database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let conn = Connection::open(path.as_ref().to_path_buf()).await?;
        Self::migrate(conn).await
    }

    /// Open a private in-memory database. Used by tests and by engines that
    /// run without a durable policy record.
    pub async fn open_in_memory() -> Result<Self, PersistError> {
        let conn = Connection::open_in_memory().await?;
        Self::migrate(conn).await
    }

    async fn migrate(conn: Connection) -> Result<Self, PersistError> {
        conn.call(|conn| {
            conn.execute(SCHEMA, [])?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Replace the `latest` record.
    pub async fn put_latest(
        &self,
        policy: &CachePolicy,
        saved_at: u64,
    ) -> Result<(), PersistError> {
        let encoded = serde_json::to_string(policy)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO config (key, policy, saved_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        policy = excluded.policy,
                        saved_at = excluded.saved_at",
                    params![LATEST_KEY, encoded, saved_at as i64],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Read the `latest` record, if any.
    pub async fn latest(&self) -> Result<Option<PersistedPolicy>, PersistError> {
        let row: Option<(String, i64)> = self
            .conn
            .call(|conn| {
                let result = conn.query_row(
                    "SELECT policy, saved_at FROM config WHERE key = ?1",
                    params![LATEST_KEY],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                );
                match result {
                    Ok(row) => Ok(Some(row)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            })
            .await?;

        let Some((encoded, saved_at)) = row else {
            return Ok(None);
        };

        let policy: CachePolicy = serde_json::from_str(&encoded)?;
        Ok(Some(PersistedPolicy {
            policy,
            saved_at: saved_at.max(0) as u64,
        }))
    }

    /// Delete the `latest` record.
    pub async fn clear_latest(&self) -> Result<(), PersistError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM config WHERE key = ?1", params![LATEST_KEY])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
