//! Cache step (spec §4.10): an in-process, TTL'd key/value store shared by
//! every flow execution, with opportunistic expiry cleanup and exclusion of
//! sensitive keys from implicit snapshot-sets.

use crate::constants::{is_sensitive_key, DEFAULT_CACHE_SAVE_AS};
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::interpolation::interpolate;
use crate::step::Step;
use crate::telemetry::record_cache_operation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    value: Value,
    created_at: DateTime<Utc>,
    /// `None` means the entry never expires (TTL = 0, spec §4.10).
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// A cache hit: the stored value plus its original creation time.
pub struct CacheHit {
    pub value: Value,
    pub created_at: DateTime<Utc>,
}

/// Lock-sharded, linearizable-per-key cache backing the Cache step. Cheap to
/// clone: it's an `Arc<DashMap<..>>` handle, so every flow sharing one
/// `Cache` instance sees the same store.
#[derive(Clone, Default)]
pub struct Cache {
    store: Arc<DashMap<String, Entry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            store: Arc::new(DashMap::new()),
        }
    }

    /// Look up `key`. An absent or expired entry is a miss; an expired entry
    /// is removed as part of the lookup (spec §3/§4.10 invariant: expired
    /// entries are never returned and are deleted on access).
    pub fn get(&self, key: &str) -> Option<CacheHit> {
        let hit = self
            .store
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| CacheHit {
                value: entry.value.clone(),
                created_at: entry.created_at,
            });

        if hit.is_none() {
            self.store.remove(key);
        }

        hit
    }

    /// Store `value` under `key`. `ttl = Duration::ZERO` means the entry
    /// never expires.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.store.insert(
            key.into(),
            Entry {
                value,
                created_at: Utc::now(),
                expires_at,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.store.remove(key).is_some()
    }

    /// Remove every entry, returning the count removed (spec §4.10:
    /// `cache_cleared_count`).
    pub fn clear(&self) -> usize {
        let count = self.store.len();
        self.store.clear();
        count
    }

    /// Opportunistically sweep expired entries. Called by the cache step on
    /// each operation rather than on a background timer, matching the
    /// read-through-cache usage pattern described in spec §4.10.
    pub fn sweep_expired(&self) {
        self.store.retain(|_, entry| !entry.is_expired());
    }

    /// Snapshot every non-expired, non-sensitive key/value pair, e.g. for a
    /// diagnostics dump. Keys matching [`is_sensitive_key`] are excluded.
    pub fn snapshot_non_sensitive(&self) -> Vec<(String, Value)> {
        self.store
            .iter()
            .filter(|entry| !entry.is_expired() && !is_sensitive_key(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value.clone()))
            .collect()
    }
}

/// Operations the cache step supports (spec §4.10). `Set`'s `value` is
/// `None` when no explicit value was configured, meaning the step snapshots
/// the live context (minus sensitive keys) as the cached value.
pub enum CacheOperation {
    Get { key: String, save_as: Option<String> },
    Set { key: String, value: Option<Value>, ttl: Option<Duration> },
    Delete { key: String },
    Clear,
}

pub struct CacheStep {
    name: String,
    description: String,
    cache: Cache,
    operation: CacheOperation,
    default_ttl: Duration,
}

impl CacheStep {
    pub fn new(name: impl Into<String>, cache: Cache, operation: CacheOperation, default_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            cache,
            operation,
            default_ttl,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Snapshot the context bag into a JSON object, excluding sensitive keys
/// (spec §4.10 Set: "excluding any key whose name ... contains" a sensitive
/// token).
fn non_sensitive_context_snapshot(ctx: &ExecutionContext) -> Value {
    let mut map = serde_json::Map::new();
    for (k, v) in ctx.snapshot() {
        if !is_sensitive_key(&k) {
            map.insert(k, v);
        }
    }
    Value::Object(map)
}

#[async_trait]
impl Step for CacheStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        self.cache.sweep_expired();
        let data = ctx.snapshot();

        match &self.operation {
            CacheOperation::Get { key, save_as } => {
                let resolved_key = interpolate(key, &data)?;
                let save_as = save_as.clone().unwrap_or_else(|| DEFAULT_CACHE_SAVE_AS.to_string());
                match self.cache.get(&resolved_key) {
                    Some(hit) => {
                        record_cache_operation("get", "hit");
                        ctx.set("cache_hit", true);
                        ctx.set(save_as, hit.value);
                        ctx.set("cache_created_at", hit.created_at.to_rfc3339());
                    }
                    None => {
                        record_cache_operation("get", "miss");
                        ctx.set("cache_hit", false);
                    }
                }
                Ok(())
            }
            CacheOperation::Set { key, value, ttl } => {
                let resolved_key = interpolate(key, &data)?;
                let stored = match value {
                    Some(v) => v.clone(),
                    None => non_sensitive_context_snapshot(ctx),
                };
                self.cache.set(resolved_key, stored, ttl.unwrap_or(self.default_ttl));
                record_cache_operation("set", "ok");
                Ok(())
            }
            CacheOperation::Delete { key } => {
                let resolved_key = interpolate(key, &data)?;
                let deleted = self.cache.delete(&resolved_key);
                ctx.set("cache_deleted", deleted);
                record_cache_operation("delete", "ok");
                Ok(())
            }
            CacheOperation::Clear => {
                let count = self.cache.clear();
                ctx.set("cache_cleared_count", count as i64);
                record_cache_operation("clear", "ok");
                Ok(())
            }
        }
    }
}
