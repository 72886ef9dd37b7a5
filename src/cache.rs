use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{CacheTtl, FailurePolicy};
use crate::kv::KvStore;
use crate::{CoachError, Result, UserId};

/// The cacheable operations; the TTL table is keyed by this, never by call
/// site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOp {
    WeaknessAnalysis,
    TrainingRecommendations,
    ModelStatus,
}

impl CacheOp {
    fn prefix(&self) -> &'static str {
        match self {
            CacheOp::WeaknessAnalysis => "ml:weakness:",
            CacheOp::TrainingRecommendations => "ml:training:",
            CacheOp::ModelStatus => "ml:status:",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CacheOp::WeaknessAnalysis => "weakness_analysis",
            CacheOp::TrainingRecommendations => "training_recommendations",
            CacheOp::ModelStatus => "model_status",
        }
    }

    fn ttl(&self, table: &CacheTtl) -> u64 {
        match self {
            CacheOp::WeaknessAnalysis => table.weakness_analysis,
            CacheOp::TrainingRecommendations => table.training_recommendations,
            CacheOp::ModelStatus => table.model_status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[allow(dead_code)]
    cached_at: i64,
    payload: T,
}

#[derive(Debug, Serialize)]
struct EnvelopeRef<'a, T> {
    cached_at: i64,
    payload: &'a T,
}

/// Snapshot of cache activity since process start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub store_errors: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    store_errors: AtomicU64,
}

/// Read-through result cache over the external key-value store.
///
/// The cache is an optimization, never a correctness dependency: under the
/// default fail-open policy every store failure is downgraded to a miss and
/// a warning. Keys are bounded-length hashes, so no parameter value ever
/// lands in the store keyspace.
pub struct ResultCache {
    kv: Arc<dyn KvStore>,
    ttl: CacheTtl,
    policy: FailurePolicy,
    counters: Counters,
}

impl ResultCache {
    pub fn new(kv: Arc<dyn KvStore>, ttl: CacheTtl, policy: FailurePolicy) -> Self {
        Self {
            kv,
            ttl,
            policy,
            counters: Counters::default(),
        }
    }

    /// Deterministic cache key: prefix plus a truncated sha-256 over the
    /// operation, user and operation parameters.
    pub fn cache_key(op: CacheOp, user: &UserId, params: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(op.name().as_bytes());
        hasher.update(b":");
        hasher.update(user.0.as_bytes());
        for p in params {
            hasher.update(b":");
            hasher.update(p.as_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            hex.push_str(&format!("{byte:02x}"));
        }
        format!("{}{hex}", op.prefix())
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        op: CacheOp,
        user: &UserId,
        params: &[String],
    ) -> Result<Option<T>> {
        let key = Self::cache_key(op, user, params);
        let raw = match self.kv.get(&key) {
            Ok(raw) => raw,
            Err(err) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                return match self.policy {
                    FailurePolicy::FailOpen => {
                        log::warn!("cache read failed for {}: {err}; treating as miss", op.name());
                        self.counters.misses.fetch_add(1, Ordering::Relaxed);
                        Ok(None)
                    }
                    FailurePolicy::FailClosed => Err(CoachError::Store(err.to_string())),
                };
            }
        };

        let Some(raw) = raw else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            log::debug!("cache miss for {} key {key}", op.name());
            return Ok(None);
        };

        match serde_json::from_str::<Envelope<T>>(&raw) {
            Ok(envelope) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                log::debug!("cache hit for {} key {key}", op.name());
                Ok(Some(envelope.payload))
            }
            Err(err) => {
                // A corrupt entry is indistinguishable from a miss; drop it.
                log::warn!("cache entry for {key} failed to decode: {err}");
                let _ = self.kv.delete(&key);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub fn put<T: Serialize>(
        &self,
        op: CacheOp,
        user: &UserId,
        params: &[String],
        value: &T,
    ) -> Result<()> {
        let key = Self::cache_key(op, user, params);
        let envelope = EnvelopeRef { cached_at: Utc::now().timestamp(), payload: value };
        let raw = serde_json::to_string(&envelope)?;

        match self.kv.set_ex(&key, &raw, op.ttl(&self.ttl)) {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    FailurePolicy::FailOpen => {
                        log::warn!("cache write failed for {}: {err}", op.name());
                        Ok(())
                    }
                    FailurePolicy::FailClosed => Err(CoachError::Store(err.to_string())),
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            writes: self.counters.writes.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 { hits as f64 / lookups as f64 } else { 0.0 },
        }
    }

    /// Store round-trip health probe.
    pub fn healthy(&self) -> bool {
        self.kv.ping().is_ok()
    }
}
