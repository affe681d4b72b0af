//! Caller-side deadlines for store calls.
//!
//! Auth-critical checks never retry; an elapsed deadline is reported as
//! `StoreError::Timeout` and the caller fails closed.
//!
//! A deadline abandons the wait, not the work. Blocking SQLite statements run
//! to completion on their own thread, so a timed-out write may still commit.
//! Refresh redemption tolerates this through the token service's replay grace.

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub async fn with_deadline<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(op, timeout_ms = limit.as_millis() as u64, "Store call timed out");
            Err(StoreError::Timeout(limit))
        }
    }
}
