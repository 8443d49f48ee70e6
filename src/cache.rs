//! Dual-tier read-through cache.
//!
//! The durable tier (SQLite) is authoritative; the volatile tier
//! ([`moka`]) is a best-effort accelerator with no durability
//! guarantee. A missing or misbehaving volatile tier degrades to
//! durable-only behavior without surfacing an error to callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::storage::{CacheStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Volatile-tier sizing. The tier holds serialized entries and evicts
/// least-recently-used ones past `max_capacity`.
#[derive(Debug, Clone)]
pub struct VolatileConfig {
    pub max_capacity: u64,
}

impl Default for VolatileConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct VolatileEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl VolatileEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |t| t > Utc::now())
    }
}

/// Two-tier key/value cache client.
///
/// Constructed explicitly and passed to whatever needs it; whether the
/// volatile tier exists is decided once here, not inspected as ambient
/// state.
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn CacheStore>,
    volatile: Option<Cache<String, VolatileEntry>>,
}

impl CacheClient {
    pub fn new(store: Arc<dyn CacheStore>, volatile: Option<VolatileConfig>) -> Self {
        let volatile = volatile.map(|cfg| {
            Cache::builder()
                .max_capacity(cfg.max_capacity)
                .support_invalidation_closures()
                .build()
        });

        Self { store, volatile }
    }

    /// Whether the volatile tier was configured.
    pub fn is_accelerated(&self) -> bool {
        self.volatile.is_some()
    }

    /// Look up `key`, volatile tier first. Expired entries are treated
    /// as absent in both tiers; corrupt volatile entries are evicted
    /// and fall through to the durable tier.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        if let Some(volatile) = &self.volatile {
            if let Some(entry) = volatile.get(key).await {
                if !entry.is_live() {
                    volatile.invalidate(key).await;
                } else {
                    match serde_json::from_str::<T>(&entry.value) {
                        Ok(value) => {
                            debug!(key, "volatile cache hit");
                            return Ok(Some(value));
                        }
                        Err(err) => {
                            warn!(key, %err, "corrupt volatile entry, evicting");
                            volatile.invalidate(key).await;
                        }
                    }
                }
            }
        }

        match self.store.get_entry(key).await? {
            Some(value) => {
                debug!(key, "durable cache hit");
                Ok(Some(serde_json::from_value(value)?))
            }
            None => {
                debug!(key, "cache miss");
                Ok(None)
            }
        }
    }

    /// Store `value` under `key` with an optional TTL.
    ///
    /// The volatile write is fire-and-forget; only a durable-tier
    /// failure fails the call.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| CacheError::InvalidTtl(e.to_string()))?,
            ),
            None => None,
        };

        let json = serde_json::to_value(value)?;

        if let Some(volatile) = &self.volatile {
            let entry = VolatileEntry {
                value: json.to_string(),
                expires_at,
            };
            volatile.insert(key.to_string(), entry).await;
        }

        self.store.put_entry(key, &json, expires_at).await?;
        debug!(key, "cache set");
        Ok(())
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        if let Some(volatile) = &self.volatile {
            volatile.invalidate(key).await;
        }
        self.store.delete_entry(key).await?;
        Ok(())
    }

    /// Remove every entry matching `pattern` from both tiers; see
    /// [`key_matches`] for the pattern semantics. Returns the
    /// durable-tier deletion count.
    pub async fn clear(&self, pattern: &str) -> CacheResult<u64> {
        if let Some(volatile) = &self.volatile {
            if pattern == "*" {
                volatile.invalidate_all();
            } else {
                let pattern = pattern.to_string();
                if let Err(err) =
                    volatile.invalidate_entries_if(move |key, _| key_matches(&pattern, key))
                {
                    // Volatile tier stays best-effort; stale entries
                    // still expire on read.
                    warn!(%err, "volatile invalidation failed");
                }
            }
        }

        let removed = self.store.clear_entries(pattern).await?;
        debug!(pattern, removed, "cache cleared");
        Ok(removed)
    }

    /// Return the cached value for `key`, or invoke `producer`, cache
    /// its result with `ttl`, and return it.
    ///
    /// Concurrent callers racing on the same missing key may all invoke
    /// the producer; there is no per-key mutual exclusion.
    pub async fn remember_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if let Some(cached) = self.get(key).await? {
            return Ok(cached);
        }

        let value = producer().await;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }

    /// Physically delete expired durable-tier entries. Runs
    /// periodically, notably as the handler body of the cache-sweep
    /// job type.
    pub async fn expire_sweep(&self) -> CacheResult<u64> {
        let removed = self.store.purge_expired().await?;
        if removed > 0 {
            debug!(removed, "expired cache entries swept");
        }
        Ok(removed)
    }
}

/// Pattern semantics shared by both tiers: `"*"` matches everything, a
/// trailing `*` makes a prefix match, anything else is a substring
/// match (embedded `*` characters are literal).
pub fn key_matches(pattern: &str, key: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }
    key.contains(pattern)
}

/// Translate a pattern into a SQL `LIKE` expression (with `\` as the
/// escape character), or `None` for match-all.
pub(crate) fn like_pattern(pattern: &str) -> Option<String> {
    if pattern == "*" {
        return None;
    }

    fn escape(s: &str) -> String {
        s.replace('\\', r"\\").replace('%', r"\%").replace('_', r"\_")
    }

    match pattern.strip_suffix('*') {
        Some(prefix) => Some(format!("{}%", escape(prefix))),
        None => Some(format!("%{}%", escape(pattern))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_all_matches_everything() {
        assert!(key_matches("*", "anything"));
        assert!(key_matches("*", ""));
    }

    #[test]
    fn trailing_star_is_prefix_match() {
        assert!(key_matches("user:*", "user:42"));
        assert!(!key_matches("user:*", "session:42"));
    }

    #[test]
    fn plain_pattern_is_substring_match() {
        assert!(key_matches("report", "kpi:report:2024"));
        assert!(!key_matches("report", "kpi:summary"));
    }

    #[test]
    fn like_pattern_translation() {
        assert_eq!(like_pattern("*"), None);
        assert_eq!(like_pattern("user:*"), Some("user:%".to_string()));
        assert_eq!(like_pattern("report"), Some("%report%".to_string()));
    }

    #[test]
    fn like_pattern_escapes_sql_wildcards() {
        assert_eq!(like_pattern("100%*"), Some(r"100\%%".to_string()));
        assert_eq!(like_pattern("a_b"), Some(r"%a\_b%".to_string()));
    }

    #[test]
    fn volatile_entry_liveness() {
        let live = VolatileEntry {
            value: "1".to_string(),
            expires_at: Some(Utc::now() + chrono::Duration::seconds(60)),
        };
        let dead = VolatileEntry {
            value: "1".to_string(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        };
        let forever = VolatileEntry {
            value: "1".to_string(),
            expires_at: None,
        };
        assert!(live.is_live());
        assert!(!dead.is_live());
        assert!(forever.is_live());
    }
}
