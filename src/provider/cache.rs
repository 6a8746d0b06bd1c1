//! Name-keyed cache with single-flight population.
//!
//! One async mutex covers lookup, the fetch on a miss, and the insert. Any
//! number of callers may ask for the same (or different) keys at once; they
//! queue on the lock, so at most one fetch is ever in flight and everyone
//! behind it sees the freshly populated entry.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::Zeroize;

use super::response::KeyGrant;
use crate::clock::Clock;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Valid up to and including `expires_at`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

pub struct KeyCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl KeyCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Return the cached value for `key`, or run `fetch` under the lock and
    /// cache its result.
    ///
    /// A failed fetch leaves the map exactly as it was.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<KeyGrant>>,
    {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            if entry.is_valid(self.clock.now()) {
                tracing::debug!(key, "Using cached key");
                return Ok(entry.value.clone());
            }
        }

        let grant = fetch().await?;
        let expires_at = expiry_after(self.clock.now(), grant.expires_in);
        let value = grant.key.clone();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: grant.key,
                expires_at,
            },
        );
        Ok(value)
    }

    /// Drop one entry, or every entry when `key` is `None`.
    pub async fn clear(&self, key: Option<&str>) {
        let mut entries = self.entries.lock().await;
        match key {
            Some(k) => {
                entries.remove(k);
            }
            None => entries.clear(),
        }
    }

    /// Copy of the entry for `key`, valid or not.
    pub async fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// `now + secs`, saturating at the latest representable instant.
fn expiry_after(now: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    chrono::Duration::try_milliseconds((secs.max(0.0) * 1000.0) as i64)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
