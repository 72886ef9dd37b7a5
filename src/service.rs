use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheOp, CacheStats, ResultCache};
use crate::config::CoachConfig;
use crate::detector::WeaknessReport;
use crate::kv::KvStore;
use crate::ratelimit::{Endpoint, RateLimiter, RateLimiterStats, UserTier};
use crate::recommend::{DetectedWeakness, RecommendationScore};
use crate::registry::{ModelHealth, ModelRegistry, SystemStatus};
use crate::skills::SkillReport;
use crate::store::{CatalogStore, MatchStore, SessionStore};
use crate::{CoachError, MatchId, Result, SkillCategory, SkillTier, UserId};

/// Combined weakness + skill analysis returned to the request boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaknessAnalysisResult {
    pub user_id: UserId,
    pub analysis_date: DateTime<Utc>,
    pub primary_weakness: Option<SkillCategory>,
    pub confidence: f64,
    pub weakness: WeaknessReport,
    pub skills: SkillReport,
    pub matches_analyzed: usize,
    pub summary: String,
    pub cache_hit: bool,
}

/// Ordered training recommendations returned to the request boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationList {
    pub user_id: UserId,
    pub skill_tier: SkillTier,
    pub recommendations: Vec<RecommendationScore>,
    pub total_packs_evaluated: usize,
    pub generated_at: DateTime<Utc>,
    pub cache_hit: bool,
}

/// Operational status of the serving pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub system_status: SystemStatus,
    pub models: Vec<ModelHealth>,
    pub cache: CacheStats,
    pub cache_store_healthy: bool,
    pub rate_limiter: RateLimiterStats,
    pub limiter_store_healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub cache_hit: bool,
}

/// The serving pipeline behind the request boundary.
///
/// Every operation runs in the mandated order: rate-limit check, cache
/// lookup, compute on miss, cache write-back. Denied or cached requests
/// never pay inference cost.
pub struct CoachService {
    config: CoachConfig,
    registry: Arc<ModelRegistry>,
    cache: ResultCache,
    limiter: RateLimiter,
    matches: Arc<dyn MatchStore>,
    catalog: Arc<dyn CatalogStore>,
    sessions: Arc<dyn SessionStore>,
}

impl CoachService {
    pub fn new(
        config: CoachConfig,
        registry: Arc<ModelRegistry>,
        kv: Arc<dyn KvStore>,
        matches: Arc<dyn MatchStore>,
        catalog: Arc<dyn CatalogStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let cache =
            ResultCache::new(kv.clone(), config.cache_ttl.clone(), config.cache_policy);
        let limiter =
            RateLimiter::new(kv, config.rate_limits.clone(), config.limiter_policy);
        Self {
            config,
            registry,
            cache,
            limiter,
            matches,
            catalog,
            sessions,
        }
    }

    /// Analyze a player's weaknesses over recent (or explicitly named)
    /// matches.
    pub fn analyze_weaknesses(
        &self,
        user: &UserId,
        tier: UserTier,
        match_ids: Option<&[MatchId]>,
    ) -> Result<WeaknessAnalysisResult> {
        self.limiter.check(user, Endpoint::AnalyzeWeaknesses, tier)?;

        let params = match match_ids {
            Some(ids) => {
                let mut sorted: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
                sorted.sort_unstable();
                sorted
            }
            None => vec!["recent".to_string()],
        };
        if let Some(mut hit) =
            self.cache.get::<WeaknessAnalysisResult>(CacheOp::WeaknessAnalysis, user, &params)?
        {
            hit.cache_hit = true;
            return Ok(hit);
        }

        let matches = match match_ids {
            Some(ids) => self.matches.matches_by_ids(user, ids)?,
            None => self.matches.processed_matches(user, self.config.feature_window)?,
        };
        if matches.len() < self.config.min_analysis_matches {
            return Err(CoachError::InsufficientData {
                required: self.config.min_analysis_matches,
                available: matches.len(),
            });
        }

        let detector_model = self.registry.weakness_detector()?;
        let detector = detector_model
            .detector()
            .ok_or_else(|| CoachError::internal("registry", "wrong model kind for detector"))?;
        let analyzer_model = self.registry.skill_analyzer()?;
        let analyzer = analyzer_model
            .analyzer()
            .ok_or_else(|| CoachError::internal("registry", "wrong model kind for analyzer"))?;

        let weakness = detector.analyze(&matches)?;
        let skills = analyzer.analyze(&matches)?;

        let (primary_weakness, confidence) = weakness
            .primary()
            .map(|f| (Some(f.category), f.mean_confidence))
            .unwrap_or((None, 0.0));
        let summary = analysis_summary(&weakness, &skills);

        let result = WeaknessAnalysisResult {
            user_id: user.clone(),
            analysis_date: Utc::now(),
            primary_weakness,
            confidence,
            weakness,
            skills,
            matches_analyzed: matches.len(),
            summary,
            cache_hit: false,
        };
        self.cache.put(CacheOp::WeaknessAnalysis, user, &params, &result)?;
        Ok(result)
    }

    /// Recommend practice content for a player.
    pub fn recommend_training(
        &self,
        user: &UserId,
        tier: UserTier,
        skill_tier: Option<SkillTier>,
        category_filter: Option<&[String]>,
        max_count: usize,
    ) -> Result<RecommendationList> {
        self.limiter.check(user, Endpoint::RecommendTraining, tier)?;

        let mut params = vec![
            skill_tier.map(|t| t.as_str().to_string()).unwrap_or_else(|| "auto".to_string()),
            max_count.to_string(),
        ];
        match category_filter {
            Some(categories) => {
                let mut sorted: Vec<String> = categories.to_vec();
                sorted.sort_unstable();
                params.extend(sorted);
            }
            None => params.push("all".to_string()),
        }
        if let Some(mut hit) =
            self.cache.get::<RecommendationList>(CacheOp::TrainingRecommendations, user, &params)?
        {
            hit.cache_hit = true;
            return Ok(hit);
        }

        let resolved_tier = match skill_tier {
            Some(tier) => tier,
            None => self.estimate_skill_tier(user)?,
        };
        let weaknesses = self.detected_weaknesses(user);

        let mut packs = self.catalog.active_packs()?;
        if let Some(filter) = category_filter {
            packs.retain(|p| filter.iter().any(|c| c == &p.category));
        }
        let total_packs_evaluated = packs.len();
        let sessions = self.sessions.sessions_for_user(user)?;

        let engine_model = self.registry.recommendation_engine()?;
        let engine = engine_model
            .recommender()
            .ok_or_else(|| CoachError::internal("registry", "wrong model kind for recommender"))?;
        let recommendations =
            engine.recommend(&packs, &weaknesses, resolved_tier, &sessions, max_count, true);

        let result = RecommendationList {
            user_id: user.clone(),
            skill_tier: resolved_tier,
            recommendations,
            total_packs_evaluated,
            generated_at: Utc::now(),
            cache_hit: false,
        };
        self.cache.put(CacheOp::TrainingRecommendations, user, &params, &result)?;
        Ok(result)
    }

    /// Operational health of models, cache and rate limiter.
    pub fn get_status(&self, user: &UserId, tier: UserTier) -> Result<StatusReport> {
        self.limiter.check(user, Endpoint::ModelStatus, tier)?;

        let global = UserId("global".to_string());
        if let Some(mut hit) = self.cache.get::<StatusReport>(CacheOp::ModelStatus, &global, &[])?
        {
            hit.cache_hit = true;
            return Ok(hit);
        }

        let models = self.registry.health_check();
        let report = StatusReport {
            system_status: ModelRegistry::system_status(&models),
            models,
            cache: self.cache.stats(),
            cache_store_healthy: self.cache.healthy(),
            rate_limiter: self.limiter.stats(),
            limiter_store_healthy: self.limiter.healthy(),
            checked_at: Utc::now(),
            cache_hit: false,
        };
        self.cache.put(CacheOp::ModelStatus, &global, &[], &report)?;
        Ok(report)
    }

    /// Estimate the player's rank tier from recent average match score;
    /// platinum when no history exists.
    fn estimate_skill_tier(&self, user: &UserId) -> Result<SkillTier> {
        let recent = self.matches.processed_matches(user, 5)?;
        if recent.is_empty() {
            return Ok(SkillTier::Platinum);
        }
        let avg = recent.iter().map(|m| m.score as f64).sum::<f64>() / recent.len() as f64;
        Ok(tier_for_average_score(avg))
    }

    /// Detected weaknesses for recommendation scoring. Falls back to a
    /// neutral mechanical default when the history is thin or the detector
    /// is unavailable; recommendations degrade rather than fail.
    fn detected_weaknesses(&self, user: &UserId) -> Vec<DetectedWeakness> {
        let fallback =
            vec![DetectedWeakness { category: SkillCategory::Mechanical, confidence: 0.5 }];

        let recent = match self.matches.processed_matches(user, self.config.feature_window) {
            Ok(recent) => recent,
            Err(err) => {
                log::warn!("match lookup failed for {user}: {err}; using default weakness");
                return fallback;
            }
        };
        if recent.len() < self.config.min_analysis_matches {
            return fallback;
        }

        let report = self
            .registry
            .weakness_detector()
            .and_then(|model| {
                model
                    .detector()
                    .ok_or_else(|| CoachError::internal("registry", "wrong model kind"))
                    .and_then(|d| d.analyze(&recent))
            });
        match report {
            Ok(report) => {
                let detected: Vec<DetectedWeakness> = report
                    .findings
                    .iter()
                    .take(3)
                    .map(|f| DetectedWeakness {
                        category: f.category,
                        confidence: f.mean_confidence,
                    })
                    .collect();
                if detected.is_empty() { fallback } else { detected }
            }
            Err(err) => {
                log::warn!("weakness detection failed for {user}: {err}; using default");
                fallback
            }
        }
    }
}

/// Score ladder used when the caller does not supply a rank tier.
pub(crate) fn tier_for_average_score(avg_score: f64) -> SkillTier {
    if avg_score >= 800.0 {
        SkillTier::GrandChampion
    } else if avg_score >= 700.0 {
        SkillTier::Champion
    } else if avg_score >= 600.0 {
        SkillTier::Diamond
    } else if avg_score >= 500.0 {
        SkillTier::Platinum
    } else if avg_score >= 400.0 {
        SkillTier::Gold
    } else if avg_score >= 300.0 {
        SkillTier::Silver
    } else {
        SkillTier::Bronze
    }
}

fn analysis_summary(weakness: &WeaknessReport, skills: &SkillReport) -> String {
    let primary = weakness
        .primary()
        .map(|f| format!("{} ({:.0}% confidence)", f.category, f.mean_confidence * 100.0))
        .unwrap_or_else(|| "no dominant weakness".to_string());
    let strengths: Vec<&str> = skills.strengths.iter().map(|c| c.as_str()).collect();
    let weak_areas: Vec<&str> = skills.weaknesses.iter().map(|c| c.as_str()).collect();

    let mut summary = format!(
        "Analysis of {} matches shows primary weakness in {primary}.",
        weakness.matches_analyzed
    );
    if !strengths.is_empty() {
        summary.push_str(&format!(" Strengths: {}.", strengths.join(", ")));
    }
    if !weak_areas.is_empty() {
        summary.push_str(&format!(" Areas to improve: {}.", weak_areas.join(", ")));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_ladder_matches_tier_boundaries() {
        assert_eq!(tier_for_average_score(850.0), SkillTier::GrandChampion);
        assert_eq!(tier_for_average_score(800.0), SkillTier::GrandChampion);
        assert_eq!(tier_for_average_score(799.0), SkillTier::Champion);
        assert_eq!(tier_for_average_score(650.0), SkillTier::Diamond);
        assert_eq!(tier_for_average_score(550.0), SkillTier::Platinum);
        assert_eq!(tier_for_average_score(450.0), SkillTier::Gold);
        assert_eq!(tier_for_average_score(350.0), SkillTier::Silver);
        assert_eq!(tier_for_average_score(100.0), SkillTier::Bronze);
    }
}
