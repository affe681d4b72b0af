//! SQLite-backed session cache
//!
//! Expiry is a column rather than a native TTL: reads ignore expired rows and
//! `purge_expired` deletes them. Each mutation is a single statement, which
//! gives the per-token atomicity the cache contract asks for.

use crate::auth::clock::Clock;
use crate::auth::session_cache::{Redemption, SessionCache, SessionRecord, SessionState};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct SqliteSessionCache {
    db_path: String,
    clock: Arc<dyn Clock>,
}

impl SqliteSessionCache {
    pub fn new(db_path: &str, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let cache = Self {
            db_path: db_path.to_string(),
            clock,
        };
        cache.init_db()?;
        info!("🗝️  Session cache initialized at: {}", db_path);
        Ok(cache)
    }

    fn init_db(&self) -> Result<(), StoreError> {
        let conn = open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                token_id TEXT PRIMARY KEY,
                principal_id TEXT NOT NULL,
                token_type TEXT NOT NULL,
                state TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                spent_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_principal ON sessions(principal_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(expires_at);",
        )?;

        // Tables created before redemption was tracked lack the column
        let has_spent_at: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('sessions') WHERE name = 'spent_at'",
            [],
            |row| row.get(0),
        )?;
        if !has_spent_at {
            conn.execute("ALTER TABLE sessions ADD COLUMN spent_at INTEGER", [])?;
        }
        Ok(())
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, i64) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.db_path.clone();
        let now = self.clock.now().timestamp();
        tokio::task::spawn_blocking(move || {
            let conn = open(&path)?;
            f(&conn, now)
        })
        .await?
    }
}

fn open(path: &str) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

#[async_trait]
impl SessionCache for SqliteSessionCache {
    async fn register(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.run(move |conn, _now| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions
                     (token_id, principal_id, token_type, state, expires_at, spent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![
                    record.token_id,
                    record.principal_id.to_string(),
                    record.token_type.as_str(),
                    SessionState::Active.as_str(),
                    record.expires_at.timestamp(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn revoke(&self, token_id: &str) -> Result<(), StoreError> {
        let token_id = token_id.to_string();
        self.run(move |conn, _now| {
            conn.execute(
                "UPDATE sessions SET state = ?2 WHERE token_id = ?1 AND state = ?3",
                params![
                    token_id,
                    SessionState::Revoked.as_str(),
                    SessionState::Active.as_str()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, StoreError> {
        let token_id = token_id.to_string();
        self.run(move |conn, now| {
            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM sessions WHERE token_id = ?1 AND expires_at > ?2",
                    params![token_id, now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(state.as_deref() != Some(SessionState::Active.as_str()))
        })
        .await
    }

    async fn consume(&self, token_id: &str) -> Result<Redemption, StoreError> {
        let token_id = token_id.to_string();
        self.run(move |conn, now| {
            let changed = conn.execute(
                "UPDATE sessions SET state = ?2, spent_at = ?4
                 WHERE token_id = ?1 AND state = ?3 AND expires_at > ?4",
                params![
                    token_id,
                    SessionState::Consumed.as_str(),
                    SessionState::Active.as_str(),
                    now
                ],
            )?;
            if changed == 1 {
                return Ok(Redemption::Redeemed);
            }

            // States never return to active, so this read classifies the loss
            let current: Option<(String, Option<i64>)> = conn
                .query_row(
                    "SELECT state, spent_at FROM sessions WHERE token_id = ?1 AND expires_at > ?2",
                    params![token_id, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match current {
                Some((state, Some(spent_at)))
                    if SessionState::parse(&state) == Some(SessionState::Consumed) =>
                {
                    let spent_at = DateTime::<Utc>::from_timestamp(spent_at, 0).ok_or_else(
                        || StoreError::Corrupt(format!("spent_at out of range: {spent_at}")),
                    )?;
                    Ok(Redemption::Replayed { spent_at })
                }
                _ => Ok(Redemption::Rejected),
            }
        })
        .await
    }

    async fn revoke_all(&self, principal_id: Uuid) -> Result<usize, StoreError> {
        self.run(move |conn, now| {
            let changed = conn.execute(
                "UPDATE sessions SET state = ?2
                 WHERE principal_id = ?1 AND state = ?3 AND expires_at > ?4",
                params![
                    principal_id.to_string(),
                    SessionState::Revoked.as_str(),
                    SessionState::Active.as_str(),
                    now
                ],
            )?;
            Ok(changed)
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.run(move |conn, now| {
            let deleted = conn.execute(
                "DELETE FROM sessions WHERE expires_at <= ?1",
                params![now],
            )?;
            Ok(deleted)
        })
        .await
    }
}
