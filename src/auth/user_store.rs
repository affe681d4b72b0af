//! Credential Storage
//! Mission: Persist principals as documents keyed by principal id
//!
//! The SQLite backend keeps each principal as one JSON document. The username
//! is duplicated into an indexed column so lookups by login name stay cheap
//! and uniqueness is enforced by the database.

use crate::auth::models::Principal;
use crate::error::StoreError;
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a new principal. Fails with `StoreError::Duplicate` on a taken username.
    async fn create(&self, principal: &Principal) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, StoreError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<Principal>, StoreError>;

    /// Replace the stored document. Returns false when the id does not exist.
    async fn update(&self, principal: &Principal) -> Result<bool, StoreError>;

    /// Returns false when the id does not exist.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<Principal>, StoreError>;
}

/// Principal storage with SQLite backend
pub struct SqliteCredentialStore {
    db_path: String,
}

impl SqliteCredentialStore {
    /// Create a new store and initialize the schema
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_db()?;
        info!("🔐 Credential store initialized at: {}", db_path);
        Ok(store)
    }

    fn init_db(&self) -> Result<(), StoreError> {
        let conn = open(&self.db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS principals (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                document TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&path)?;
            f(&conn)
        })
        .await?
    }
}

fn open(path: &str) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn decode(document: String) -> Result<Principal, StoreError> {
    Ok(serde_json::from_str(&document)?)
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn create(&self, principal: &Principal) -> Result<(), StoreError> {
        let document = serde_json::to_string(principal)?;
        let id = principal.id.to_string();
        let username = principal.username.clone();

        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO principals (id, username, document) VALUES (?1, ?2, ?3)",
                params![id, username, document],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate(username)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        self.run(move |conn| {
            let document: Option<String> = conn
                .query_row(
                    "SELECT document FROM principals WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            document.map(decode).transpose()
        })
        .await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Principal>, StoreError> {
        let username = username.to_string();
        self.run(move |conn| {
            let document: Option<String> = conn
                .query_row(
                    "SELECT document FROM principals WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            document.map(decode).transpose()
        })
        .await
    }

    async fn update(&self, principal: &Principal) -> Result<bool, StoreError> {
        let document = serde_json::to_string(principal)?;
        let id = principal.id.to_string();
        let username = principal.username.clone();

        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE principals SET username = ?2, document = ?3 WHERE id = ?1",
                params![id, username, document],
            );
            match updated {
                Ok(rows) => Ok(rows == 1),
                Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate(username)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let rows = conn.execute(
                "DELETE FROM principals WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(rows == 1)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Principal>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT document FROM principals ORDER BY username")?;
            let documents = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            documents.into_iter().map(decode).collect()
        })
        .await
    }
}
