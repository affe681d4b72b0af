//! Redis-backed session cache
//!
//! Key layout:
//! - `session:{token_id}` -> `active` | `revoked` | `consumed:{unix secs}`,
//!   expiring at the same instant as the token
//! - `principal_sessions:{principal_id}` -> set of token ids, kept alive as
//!   long as its longest-lived member
//!
//! State changes go through a Lua script that only rewrites `active` keys.
//! The principal index relies on `EXPIREAT ... NX|GT`, so the server must be
//! Redis 7 or newer.

use crate::auth::clock::Clock;
use crate::auth::session_cache::{Redemption, SessionCache, SessionRecord, SessionState};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// KEYS[1] session key, ARGV[1] replacement state. Returns the prior value.
const LEAVE_ACTIVE: &str = r"
local current = redis.call('GET', KEYS[1])
if current == 'active' then
    redis.call('SET', KEYS[1], ARGV[1], 'KEEPTTL')
end
return current
";

const CONSUMED_PREFIX: &str = "consumed:";

pub struct RedisSessionCache {
    mgr: ConnectionManager,
    clock: Arc<dyn Clock>,
    transition: Script,
}

impl RedisSessionCache {
    pub async fn connect(redis_url: &str, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let mgr = ConnectionManager::new(client).await?;
        info!("🗝️  Session cache connected to Redis");
        Ok(Self {
            mgr,
            clock,
            transition: Script::new(LEAVE_ACTIVE),
        })
    }

    fn session_key(token_id: &str) -> String {
        format!("session:{token_id}")
    }

    fn principal_key(principal_id: Uuid) -> String {
        format!("principal_sessions:{principal_id}")
    }

    /// Move an active key to `next`, returning the previous value.
    async fn leave_active(
        &self,
        token_id: &str,
        next: &str,
    ) -> Result<Option<String>, StoreError> {
        let previous: Option<String> = self
            .transition
            .key(Self::session_key(token_id))
            .arg(next)
            .invoke_async(&mut self.mgr.clone())
            .await?;
        Ok(previous)
    }
}

/// Commands that store `record` as active. The key and the index expire at
/// absolute times so they never outlive, or undercut, the token's `exp`.
fn register_pipeline(record: &SessionRecord) -> redis::Pipeline {
    let expires_at = record.expires_at.timestamp();
    let index = RedisSessionCache::principal_key(record.principal_id);

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(RedisSessionCache::session_key(&record.token_id))
        .arg(SessionState::Active.as_str())
        .arg("EXAT")
        .arg(expires_at)
        .ignore()
        .cmd("SADD")
        .arg(&index)
        .arg(&record.token_id)
        .ignore()
        .cmd("EXPIREAT")
        .arg(&index)
        .arg(expires_at)
        .arg("NX")
        .ignore()
        .cmd("EXPIREAT")
        .arg(&index)
        .arg(expires_at)
        .arg("GT")
        .ignore();
    pipe
}

/// Classify the value a session key held before `consume` touched it.
fn redemption_from(previous: Option<&str>) -> Result<Redemption, StoreError> {
    let Some(previous) = previous else {
        return Ok(Redemption::Rejected);
    };
    if previous == SessionState::Active.as_str() {
        return Ok(Redemption::Redeemed);
    }
    match previous.strip_prefix(CONSUMED_PREFIX) {
        Some(secs) => {
            let spent_at = secs
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .ok_or_else(|| StoreError::Corrupt(format!("bad session state: {previous}")))?;
            Ok(Redemption::Replayed { spent_at })
        }
        None => Ok(Redemption::Rejected),
    }
}

#[async_trait]
impl SessionCache for RedisSessionCache {
    async fn register(&self, record: SessionRecord) -> Result<(), StoreError> {
        let _: () = register_pipeline(&record)
            .query_async(&mut self.mgr.clone())
            .await?;

        debug!(
            token_id = %record.token_id,
            expires_at = %record.expires_at,
            "Registered session"
        );
        Ok(())
    }

    async fn revoke(&self, token_id: &str) -> Result<(), StoreError> {
        self.leave_active(token_id, SessionState::Revoked.as_str())
            .await?;
        Ok(())
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, StoreError> {
        let state: Option<String> = self.mgr.clone().get(Self::session_key(token_id)).await?;
        Ok(state.as_deref() != Some(SessionState::Active.as_str()))
    }

    async fn consume(&self, token_id: &str) -> Result<Redemption, StoreError> {
        let spent = format!("{CONSUMED_PREFIX}{}", self.clock.now().timestamp());
        let previous = self.leave_active(token_id, &spent).await?;
        redemption_from(previous.as_deref())
    }

    async fn revoke_all(&self, principal_id: Uuid) -> Result<usize, StoreError> {
        let token_ids: Vec<String> = self
            .mgr
            .clone()
            .smembers(Self::principal_key(principal_id))
            .await?;

        let mut revoked = 0;
        for token_id in &token_ids {
            let previous = self
                .leave_active(token_id, SessionState::Revoked.as_str())
                .await?;
            if previous.as_deref() == Some(SessionState::Active.as_str()) {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
