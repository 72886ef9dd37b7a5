use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::ratelimit::Endpoint;

/// How a guard component reacts when its backing store is unreachable.
///
/// `FailOpen` lets the request proceed (availability over strictness);
/// `FailClosed` surfaces the store failure to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerKind {
    Standard,
    MinMax,
    Robust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImputeStrategy {
    Mean,
    Median,
    MostFrequent,
}

/// Supervised feature-selection method used when a top-k count is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    MutualInfo,
    FTest,
    RecursiveElimination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
        }
    }
}

/// Per-operation result cache TTLs, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtl {
    pub weakness_analysis: u64,
    pub training_recommendations: u64,
    pub model_status: u64,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            weakness_analysis: 3600,
            training_recommendations: 1800,
            model_status: 300,
        }
    }
}

/// Sliding-window limits per user tier. Endpoints absent from a tier table
/// fall back to that tier's default limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    /// Store-level key TTL, slightly longer than the window so idle keys
    /// clean themselves up.
    pub key_ttl_secs: u64,
    pub free: HashMap<Endpoint, u64>,
    pub premium: HashMap<Endpoint, u64>,
    pub elevated: HashMap<Endpoint, u64>,
    pub default_free: u64,
    pub default_premium: u64,
    pub default_elevated: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let free = HashMap::from([
            (Endpoint::AnalyzeWeaknesses, 10),
            (Endpoint::RecommendTraining, 10),
            // More generous for monitoring.
            (Endpoint::ModelStatus, 60),
        ]);
        let premium = HashMap::from([
            (Endpoint::AnalyzeWeaknesses, 100),
            (Endpoint::RecommendTraining, 100),
            (Endpoint::ModelStatus, 300),
        ]);
        let elevated = HashMap::from([
            (Endpoint::AnalyzeWeaknesses, 1000),
            (Endpoint::RecommendTraining, 1000),
            (Endpoint::ModelStatus, 3000),
        ]);
        Self {
            window_secs: 3600,
            key_ttl_secs: 3900,
            free,
            premium,
            elevated,
            default_free: 10,
            default_premium: 100,
            default_elevated: 1000,
        }
    }
}

/// Top-level configuration for the serving pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachConfig {
    /// Number of recent matches used for rolling features and analysis.
    pub feature_window: usize,
    /// Minimum processed matches required to train the detector.
    pub min_matches: usize,
    /// Minimum processed matches required for a reliable analysis call.
    pub min_analysis_matches: usize,
    /// Minimum calibrated probability for a confident weakness call.
    pub confidence_threshold: f64,
    /// Holdout accuracy below this marks the detector degraded.
    pub min_accuracy: f64,
    /// Seed for every randomized step, for reproducible training.
    pub random_state: u64,
    pub forest: ForestParams,
    /// Top-k supervised feature selection; `None` keeps all features.
    pub selection_k: Option<usize>,
    pub selection_method: SelectionMethod,
    pub scaler: ScalerKind,
    pub imputation: ImputeStrategy,
    /// Recent-match window for trend comparisons in the skill analyzer.
    pub trend_window: usize,
    pub cache_ttl: CacheTtl,
    pub cache_policy: FailurePolicy,
    pub limiter_policy: FailurePolicy,
    pub rate_limits: RateLimitConfig,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            feature_window: 10,
            min_matches: 5,
            min_analysis_matches: 3,
            confidence_threshold: 0.7,
            min_accuracy: 0.8,
            random_state: 42,
            forest: ForestParams::default(),
            selection_k: Some(20),
            selection_method: SelectionMethod::MutualInfo,
            scaler: ScalerKind::Standard,
            imputation: ImputeStrategy::Median,
            trend_window: 5,
            cache_ttl: CacheTtl::default(),
            cache_policy: FailurePolicy::FailOpen,
            limiter_policy: FailurePolicy::FailOpen,
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl CoachConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("RL_COACH_FEATURE_WINDOW") {
            cfg.feature_window = v.max(1);
        }
        if let Some(v) = env_usize("RL_COACH_MIN_MATCHES") {
            cfg.min_matches = v.max(1);
        }
        if let Some(v) = env_f64("RL_COACH_CONFIDENCE_THRESHOLD") {
            cfg.confidence_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_usize("RL_COACH_N_TREES") {
            cfg.forest.n_trees = v.max(1);
        }
        if let Ok(raw) = env::var("RL_COACH_FAIL_CLOSED") {
            if !matches!(raw.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "off" | "no")
            {
                cfg.cache_policy = FailurePolicy::FailClosed;
                cfg.limiter_policy = FailurePolicy::FailClosed;
            }
        }
        cfg
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_f64(name: &str) -> Option<f64> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_tier_tables() {
        let cfg = RateLimitConfig::default();
        assert_eq!(cfg.free[&Endpoint::AnalyzeWeaknesses], 10);
        assert_eq!(cfg.premium[&Endpoint::RecommendTraining], 100);
        assert_eq!(cfg.elevated[&Endpoint::ModelStatus], 3000);
        assert!(cfg.key_ttl_secs > cfg.window_secs);
    }

    #[test]
    fn default_ttls_are_table_driven() {
        let ttl = CacheTtl::default();
        assert_eq!(ttl.weakness_analysis, 3600);
        assert_eq!(ttl.training_recommendations, 1800);
        assert_eq!(ttl.model_status, 300);
    }

    #[test]
    fn default_policies_fail_open() {
        let cfg = CoachConfig::default();
        assert_eq!(cfg.cache_policy, FailurePolicy::FailOpen);
        assert_eq!(cfg.limiter_policy, FailurePolicy::FailOpen);
    }
}
