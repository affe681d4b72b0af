//! Session Cache
//! Mission: Track which token ids are still live so revocation beats signature validity
//!
//! Every operation touches a single token id, so backends only need per-key
//! atomicity. A record that cannot be found reads as revoked.
//!
//! Records only ever leave `active`: revocation and redemption are one-way,
//! and neither overwrites the other. A spent refresh token stays
//! distinguishable from a revoked one until it expires.

use crate::auth::clock::Clock;
use crate::auth::models::TokenType;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Revoked,
    /// Redeemed by a refresh grant.
    Consumed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Revoked => "revoked",
            SessionState::Consumed => "consumed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionState::Active),
            "revoked" => Some(SessionState::Revoked),
            "consumed" => Some(SessionState::Consumed),
            _ => None,
        }
    }
}

/// Outcome of redeeming a single-use token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redemption {
    /// The record was active and this caller spent it.
    Redeemed,
    /// The record had already been spent at `spent_at`.
    Replayed { spent_at: DateTime<Utc> },
    /// Revoked, expired or never registered.
    Rejected,
}

/// Registration payload for one issued token.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub token_id: String,
    pub principal_id: Uuid,
    pub token_type: TokenType,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Store an active record that lives until `record.expires_at`.
    async fn register(&self, record: SessionRecord) -> Result<(), StoreError>;

    /// Mark an active token id revoked. Revoking twice, revoking a spent id, or
    /// revoking an unknown id, succeeds and leaves the record as it was.
    async fn revoke(&self, token_id: &str) -> Result<(), StoreError>;

    /// Absent and expired records count as revoked.
    async fn is_revoked(&self, token_id: &str) -> Result<bool, StoreError>;

    /// Atomically flip an active record to consumed.
    ///
    /// Only the caller that performed the transition sees `Redeemed`.
    async fn consume(&self, token_id: &str) -> Result<Redemption, StoreError>;

    /// Revoke every live record belonging to `principal_id`, returning how many.
    async fn revoke_all(&self, principal_id: Uuid) -> Result<usize, StoreError>;

    /// Drop expired records. Backends with native TTL return 0.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

struct Entry {
    principal_id: Uuid,
    state: SessionState,
    expires_at: DateTime<Utc>,
    spent_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Entry>,
    by_principal: HashMap<Uuid, HashSet<String>>,
}

impl Inner {
    fn remove(&mut self, token_id: &str) {
        if let Some(entry) = self.records.remove(token_id) {
            if let Some(ids) = self.by_principal.get_mut(&entry.principal_id) {
                ids.remove(token_id);
                if ids.is_empty() {
                    self.by_principal.remove(&entry.principal_id);
                }
            }
        }
    }

    /// Live entry for `token_id`, evicting it first if it has expired.
    fn live(&mut self, token_id: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        let expired = self
            .records
            .get(token_id)
            .map(|e| e.expires_at <= now)
            .unwrap_or(false);
        if expired {
            self.remove(token_id);
            return None;
        }
        self.records.get_mut(token_id)
    }
}

/// In-process session cache
pub struct InMemorySessionCache {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl InMemorySessionCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionCache for InMemorySessionCache {
    async fn register(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .by_principal
            .entry(record.principal_id)
            .or_default()
            .insert(record.token_id.clone());
        inner.records.insert(
            record.token_id,
            Entry {
                principal_id: record.principal_id,
                state: SessionState::Active,
                expires_at: record.expires_at,
                spent_at: None,
            },
        );
        Ok(())
    }

    async fn revoke(&self, token_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.live(token_id, now) {
            if entry.state == SessionState::Active {
                entry.state = SessionState::Revoked;
            }
        }
        Ok(())
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Ok(match inner.live(token_id, now) {
            Some(entry) => entry.state != SessionState::Active,
            None => true,
        })
    }

    async fn consume(&self, token_id: &str) -> Result<Redemption, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.live(token_id, now) else {
            return Ok(Redemption::Rejected);
        };
        Ok(match (entry.state, entry.spent_at) {
            (SessionState::Active, _) => {
                entry.state = SessionState::Consumed;
                entry.spent_at = Some(now);
                Redemption::Redeemed
            }
            (SessionState::Consumed, Some(spent_at)) => Redemption::Replayed { spent_at },
            _ => Redemption::Rejected,
        })
    }

    async fn revoke_all(&self, principal_id: Uuid) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let ids: Vec<String> = inner
            .by_principal
            .get(&principal_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut revoked = 0;
        for id in ids {
            if let Some(entry) = inner.live(&id, now) {
                if entry.state == SessionState::Active {
                    entry.state = SessionState::Revoked;
                    revoked += 1;
                }
            }
        }
        Ok(revoked)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        Ok(expired.len())
    }
}

/// Periodically evict expired records from caches without native TTL.
pub fn spawn_session_sweeper(cache: Arc<dyn SessionCache>, every: Duration) -> JoinHandle<()> {
    info!(interval_secs = every.as_secs(), "🧹 Starting session sweeper");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match cache.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "Purged expired session records"),
                Err(e) => warn!("Session sweep failed: {e}"),
            }
        }
    })
}
