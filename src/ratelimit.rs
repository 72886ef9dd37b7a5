use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{FailurePolicy, RateLimitConfig};
use crate::kv::KvStore;
use crate::{CoachError, Result, UserId};

/// Externally-triggered operations subject to rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endpoint {
    AnalyzeWeaknesses,
    RecommendTraining,
    ModelStatus,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] =
        [Endpoint::AnalyzeWeaknesses, Endpoint::RecommendTraining, Endpoint::ModelStatus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::AnalyzeWeaknesses => "analyze-weaknesses",
            Endpoint::RecommendTraining => "recommend-training",
            Endpoint::ModelStatus => "model-status",
        }
    }

    fn index(&self) -> usize {
        match self {
            Endpoint::AnalyzeWeaknesses => 0,
            Endpoint::RecommendTraining => 1,
            Endpoint::ModelStatus => 2,
        }
    }
}

/// Limit tier attached to the requesting account. `Elevated` exists for
/// monitoring and internal tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Free,
    Premium,
    Elevated,
}

/// Limit state returned with every check; carried inside
/// [`CoachError::RateLimited`] on denial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds when the window fully resets.
    pub reset_at: i64,
    /// Seconds until the next slot frees up; only set on denial.
    pub retry_after: Option<u64>,
}

/// Per-endpoint counters since process start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EndpointStats {
    pub endpoint: Endpoint,
    pub allowed: u64,
    pub denied: u64,
    pub store_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub endpoints: Vec<EndpointStats>,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: [AtomicU64; 3],
    denied: [AtomicU64; 3],
    store_errors: [AtomicU64; 3],
}

/// Sliding-window rate limiter over the external key-value store.
///
/// Each check is two atomic store calls: trim-and-count, then (when allowed)
/// append-and-refresh-TTL. Store failures follow the configured policy;
/// the default is fail-open, trading strictness for availability.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitConfig,
    policy: FailurePolicy,
    counters: Counters,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig, policy: FailurePolicy) -> Self {
        Self {
            kv,
            config,
            policy,
            counters: Counters::default(),
        }
    }

    fn key(user: &UserId, endpoint: Endpoint) -> String {
        format!("rl:{}:{}", user.0, endpoint.as_str())
    }

    fn limit_for(&self, tier: UserTier, endpoint: Endpoint) -> u64 {
        match tier {
            UserTier::Free => {
                self.config.free.get(&endpoint).copied().unwrap_or(self.config.default_free)
            }
            UserTier::Premium => self
                .config
                .premium
                .get(&endpoint)
                .copied()
                .unwrap_or(self.config.default_premium),
            UserTier::Elevated => self
                .config
                .elevated
                .get(&endpoint)
                .copied()
                .unwrap_or(self.config.default_elevated),
        }
    }

    /// Consume one slot if the caller is within their limit.
    ///
    /// Returns the remaining-slot view on success and
    /// [`CoachError::RateLimited`] on denial.
    pub fn check(&self, user: &UserId, endpoint: Endpoint, tier: UserTier) -> Result<RateLimitInfo> {
        self.check_at(user, endpoint, tier, Utc::now().timestamp_millis())
    }

    /// [`Self::check`] with an injected clock.
    pub fn check_at(
        &self,
        user: &UserId,
        endpoint: Endpoint,
        tier: UserTier,
        now_ms: i64,
    ) -> Result<RateLimitInfo> {
        let limit = self.limit_for(tier, endpoint);
        let window_ms = self.config.window_secs as i64 * 1000;
        let key = Self::key(user, endpoint);
        let reset_at = (now_ms + window_ms) / 1000;

        let probe = match self.kv.window_count(&key, now_ms - window_ms) {
            Ok(probe) => probe,
            Err(err) => return self.on_store_error(endpoint, limit, reset_at, err),
        };

        if probe.count >= limit {
            // Next slot opens when the oldest surviving request leaves the
            // window; 60s fallback when the set is unexpectedly empty.
            let retry_after = probe
                .oldest
                .map(|oldest| ((oldest + window_ms - now_ms) / 1000).max(1) as u64)
                .unwrap_or(60);
            let info = RateLimitInfo {
                limit,
                remaining: 0,
                reset_at,
                retry_after: Some(retry_after),
            };
            self.counters.denied[endpoint.index()].fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "rate limit exceeded for {} on {}: {}/{limit}",
                user,
                endpoint.as_str(),
                probe.count
            );
            return Err(CoachError::RateLimited(info));
        }

        if let Err(err) = self.kv.window_append(&key, now_ms, self.config.key_ttl_secs) {
            return self.on_store_error(endpoint, limit, reset_at, err);
        }

        self.counters.allowed[endpoint.index()].fetch_add(1, Ordering::Relaxed);
        Ok(RateLimitInfo {
            limit,
            remaining: limit.saturating_sub(probe.count + 1),
            reset_at,
            retry_after: None,
        })
    }

    /// Current window state without consuming a slot.
    pub fn status(&self, user: &UserId, endpoint: Endpoint, tier: UserTier) -> RateLimitInfo {
        self.status_at(user, endpoint, tier, Utc::now().timestamp_millis())
    }

    pub fn status_at(
        &self,
        user: &UserId,
        endpoint: Endpoint,
        tier: UserTier,
        now_ms: i64,
    ) -> RateLimitInfo {
        let limit = self.limit_for(tier, endpoint);
        let window_ms = self.config.window_secs as i64 * 1000;
        let reset_at = (now_ms + window_ms) / 1000;
        let count = self
            .kv
            .window_count(&Self::key(user, endpoint), now_ms - window_ms)
            .map(|p| p.count)
            .unwrap_or(0);
        RateLimitInfo {
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            retry_after: None,
        }
    }

    /// Clear a user's window for one endpoint (operator action).
    pub fn reset(&self, user: &UserId, endpoint: Endpoint) -> Result<bool> {
        self.kv
            .delete(&Self::key(user, endpoint))
            .map_err(|err| CoachError::Store(err.to_string()))
    }

    fn on_store_error(
        &self,
        endpoint: Endpoint,
        limit: u64,
        reset_at: i64,
        err: crate::kv::KvError,
    ) -> Result<RateLimitInfo> {
        self.counters.store_errors[endpoint.index()].fetch_add(1, Ordering::Relaxed);
        match self.policy {
            FailurePolicy::FailOpen => {
                log::warn!(
                    "rate limiter store error on {}: {err}; allowing request",
                    endpoint.as_str()
                );
                self.counters.allowed[endpoint.index()].fetch_add(1, Ordering::Relaxed);
                Ok(RateLimitInfo {
                    limit,
                    remaining: limit.saturating_sub(1),
                    reset_at,
                    retry_after: None,
                })
            }
            FailurePolicy::FailClosed => Err(CoachError::Store(err.to_string())),
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            endpoints: Endpoint::ALL
                .iter()
                .map(|&endpoint| EndpointStats {
                    endpoint,
                    allowed: self.counters.allowed[endpoint.index()].load(Ordering::Relaxed),
                    denied: self.counters.denied[endpoint.index()].load(Ordering::Relaxed),
                    store_errors: self.counters.store_errors[endpoint.index()]
                        .load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    /// Store round-trip health probe.
    pub fn healthy(&self) -> bool {
        self.kv.ping().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{InMemoryKv, KvError, WindowProbe};

    struct DownKv;

    impl KvStore for DownKv {
        fn get(&self, _: &str) -> std::result::Result<Option<String>, KvError> {
            Err(KvError::Unavailable("down".into()))
        }
        fn set_ex(&self, _: &str, _: &str, _: u64) -> std::result::Result<(), KvError> {
            Err(KvError::Unavailable("down".into()))
        }
        fn delete(&self, _: &str) -> std::result::Result<bool, KvError> {
            Err(KvError::Unavailable("down".into()))
        }
        fn window_count(&self, _: &str, _: i64) -> std::result::Result<WindowProbe, KvError> {
            Err(KvError::Unavailable("down".into()))
        }
        fn window_append(&self, _: &str, _: i64, _: u64) -> std::result::Result<(), KvError> {
            Err(KvError::Unavailable("down".into()))
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            Arc::new(InMemoryKv::new()),
            RateLimitConfig::default(),
            FailurePolicy::FailOpen,
        )
    }

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    const T0: i64 = 1_750_000_000_000;

    #[test]
    fn free_tier_allows_ten_then_denies_the_eleventh() {
        let rl = limiter();
        let u = user("u1");
        for i in 0..10 {
            let info = rl
                .check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + i * 1000)
                .unwrap();
            assert_eq!(info.remaining, 9 - i as u64);
        }
        let err = rl
            .check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + 10_000)
            .unwrap_err();
        match err {
            CoachError::RateLimited(info) => {
                assert_eq!(info.limit, 10);
                assert_eq!(info.remaining, 0);
                assert!(info.retry_after.unwrap() > 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn window_elapse_frees_slots() {
        let rl = limiter();
        let u = user("u1");
        for i in 0..10 {
            rl.check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + i * 1000)
                .unwrap();
        }
        assert!(rl.check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + 11_000).is_err());

        // One hour later the first stamps have left the window.
        let later = T0 + 3_600_000 + 5_000;
        assert!(rl.check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, later).is_ok());
    }

    #[test]
    fn retry_after_counts_down_from_oldest_request() {
        let rl = limiter();
        let u = user("u1");
        for i in 0..10 {
            rl.check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + i * 1000)
                .unwrap();
        }
        // 30 minutes in: the oldest stamp has 30 minutes left in the window.
        let now = T0 + 1_800_000;
        let err = rl.check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, now).unwrap_err();
        let CoachError::RateLimited(info) = err else { panic!("expected rate limit") };
        let retry = info.retry_after.unwrap();
        assert!((1795..=1800).contains(&retry), "retry_after {retry}");
    }

    #[test]
    fn tiers_have_independent_limits() {
        let rl = limiter();
        let premium = user("p1");
        for i in 0..50 {
            rl.check_at(&premium, Endpoint::AnalyzeWeaknesses, UserTier::Premium, T0 + i * 100)
                .unwrap();
        }
        let info = rl.status_at(&premium, Endpoint::AnalyzeWeaknesses, UserTier::Premium, T0 + 6_000);
        assert_eq!(info.limit, 100);
        assert_eq!(info.remaining, 50);
    }

    #[test]
    fn users_and_endpoints_are_isolated() {
        let rl = limiter();
        for i in 0..10 {
            rl.check_at(&user("a"), Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + i * 1000)
                .unwrap();
        }
        // A different user, and the same user on a different endpoint, both pass.
        assert!(
            rl.check_at(&user("b"), Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + 11_000)
                .is_ok()
        );
        assert!(
            rl.check_at(&user("a"), Endpoint::RecommendTraining, UserTier::Free, T0 + 11_000)
                .is_ok()
        );
    }

    #[test]
    fn status_does_not_consume_a_slot() {
        let rl = limiter();
        let u = user("u1");
        rl.check_at(&u, Endpoint::ModelStatus, UserTier::Free, T0).unwrap();
        let before = rl.status_at(&u, Endpoint::ModelStatus, UserTier::Free, T0 + 1000);
        let after = rl.status_at(&u, Endpoint::ModelStatus, UserTier::Free, T0 + 2000);
        assert_eq!(before.remaining, after.remaining);
        assert_eq!(before.remaining, 59);
    }

    #[test]
    fn store_outage_fails_open() {
        let rl = RateLimiter::new(
            Arc::new(DownKv),
            RateLimitConfig::default(),
            FailurePolicy::FailOpen,
        );
        let info = rl.check_at(&user("u1"), Endpoint::AnalyzeWeaknesses, UserTier::Free, T0).unwrap();
        assert_eq!(info.remaining, 9);
        let stats = rl.stats();
        assert_eq!(stats.endpoints[0].store_errors, 1);
        assert_eq!(stats.endpoints[0].allowed, 1);
    }

    #[test]
    fn store_outage_fails_closed_when_configured() {
        let rl = RateLimiter::new(
            Arc::new(DownKv),
            RateLimitConfig::default(),
            FailurePolicy::FailClosed,
        );
        let err =
            rl.check_at(&user("u1"), Endpoint::AnalyzeWeaknesses, UserTier::Free, T0).unwrap_err();
        assert!(matches!(err, CoachError::Store(_)));
    }

    #[test]
    fn reset_clears_the_window() {
        let rl = limiter();
        let u = user("u1");
        for i in 0..10 {
            rl.check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + i * 1000)
                .unwrap();
        }
        assert!(rl.reset(&u, Endpoint::AnalyzeWeaknesses).unwrap());
        assert!(rl.check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + 11_000).is_ok());
    }

    #[test]
    fn unconfigured_endpoint_uses_tier_default() {
        let mut config = RateLimitConfig::default();
        config.free.remove(&Endpoint::ModelStatus);
        let rl = RateLimiter::new(Arc::new(InMemoryKv::new()), config, FailurePolicy::FailOpen);
        let info = rl.status_at(&user("u1"), Endpoint::ModelStatus, UserTier::Free, T0);
        assert_eq!(info.limit, 10);
    }

    #[test]
    fn counters_track_allowed_and_denied() {
        let rl = limiter();
        let u = user("u1");
        for i in 0..11 {
            let _ = rl.check_at(&u, Endpoint::AnalyzeWeaknesses, UserTier::Free, T0 + i * 1000);
        }
        let stats = rl.stats();
        let analyze = stats
            .endpoints
            .iter()
            .find(|e| e.endpoint == Endpoint::AnalyzeWeaknesses)
            .unwrap();
        assert_eq!(analyze.allowed, 10);
        assert_eq!(analyze.denied, 1);
    }
}
