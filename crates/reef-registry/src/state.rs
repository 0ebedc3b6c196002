// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite-backed enable flags for builtin plugins.
//!
//! Uploaded plugins are reconstructed from the blob store instead; this table
//! only remembers whether a builtin was switched off.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use reef_core::ReefError;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::debug;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS plugin_state (
    id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL,
    updated_at TEXT NOT NULL
)";

fn storage_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> ReefError {
    ReefError::Storage {
        source: Box::new(e),
    }
}

/// Persisted plugin enable flags.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Connection>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Opens (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ReefError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ReefError::Storage {
                    source: Box::new(e),
                })?;
        }
        let conn = Connection::open(path).await.map_err(|e| ReefError::Storage {
            source: Box::new(e),
        })?;
        debug!(path = %path.display(), "opened plugin state database");
        Self::with_connection(Arc::new(conn)).await
    }

    pub async fn open_in_memory() -> Result<Self, ReefError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| ReefError::Storage {
                source: Box::new(e),
            })?;
        Self::with_connection(Arc::new(conn)).await
    }

    /// Wraps an existing connection and ensures the table exists.
    pub async fn with_connection(conn: Arc<Connection>) -> Result<Self, ReefError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(storage_err)?;
        Ok(Self { conn })
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ReefError> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO plugin_state (id, enabled, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(id) DO UPDATE SET enabled = excluded.enabled, \
                     updated_at = excluded.updated_at",
                    rusqlite::params![id, enabled, now],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    /// The persisted flag, or `None` if this plugin was never recorded.
    pub async fn enabled(&self, id: &str) -> Result<Option<bool>, ReefError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let enabled = conn
                    .query_row(
                        "SELECT enabled FROM plugin_state WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get::<_, bool>(0),
                    )
                    .optional()?;
                Ok(enabled)
            })
            .await
            .map_err(storage_err)
    }

    /// All recorded flags, ordered by id.
    pub async fn all(&self) -> Result<Vec<(String, bool)>, ReefError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, enabled FROM plugin_state ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(storage_err)
    }

    pub async fn remove(&self, id: &str) -> Result<(), ReefError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM plugin_state WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }
}
