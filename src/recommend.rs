use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{PackId, SkillCategory, SkillTier, UserId};

/// Catalog entry for a practice pack, owned by the catalog collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingPackRecord {
    pub id: PackId,
    pub name: String,
    pub code: String,
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    /// Coarse 1-5 difficulty used for display.
    pub difficulty: u8,
    /// Rank tier the pack targets, for difficulty matching.
    pub skill_tier: SkillTier,
    pub rating: f64,
    pub rating_count: u32,
    pub usage_count: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub is_official: bool,
    pub is_featured: bool,
    pub is_active: bool,
}

/// One completed practice session, owned by the catalog collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSessionRecord {
    pub user_id: UserId,
    pub pack_id: PackId,
    pub category: String,
    pub started_at: DateTime<Utc>,
}

/// A detected weakness fed into recommendation scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedWeakness {
    pub category: SkillCategory,
    pub confidence: f64,
}

/// Scored candidate pack with per-component breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationScore {
    pub pack_id: PackId,
    pub name: String,
    pub code: String,
    pub category: String,
    pub skill_tier: SkillTier,
    pub difficulty: u8,
    pub relevance: f64,
    pub difficulty_match: f64,
    pub quality: f64,
    pub preference: f64,
    pub total: f64,
    pub reasoning: Vec<String>,
}

/// Pack categories/tags that address each weakness category.
static RELEVANCE: Lazy<Vec<(SkillCategory, &'static [&'static str])>> = Lazy::new(|| {
    use SkillCategory::*;
    vec![
        (Mechanical, &["shooting", "dribbling", "aerials"][..]),
        (Positioning, &["positioning", "saves"][..]),
        (GameSense, &["positioning", "saves", "shooting"][..]),
        (BoostManagement, &["dribbling", "positioning"][..]),
        (Rotation, &["positioning", "saves"][..]),
        (AerialAbility, &["aerials", "wall_play"][..]),
        (Shooting, &["shooting", "dribbling"][..]),
        (Defending, &["saves", "positioning"][..]),
    ]
});

fn relevant_categories(weakness: SkillCategory) -> &'static [&'static str] {
    RELEVANCE
        .iter()
        .find(|(cat, _)| *cat == weakness)
        .map(|(_, cats)| *cats)
        .unwrap_or(&[])
}

const WEIGHT_RELEVANCE: f64 = 0.40;
const WEIGHT_DIFFICULTY: f64 = 0.25;
const WEIGHT_QUALITY: f64 = 0.20;
const WEIGHT_PREFERENCE: f64 = 0.15;

/// Multi-factor recommendation scorer. Stateless and deterministic: ties are
/// broken by catalog id so identical inputs always produce identical output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationEngine;

impl RecommendationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Score one candidate pack against the detected weaknesses and player
    /// context.
    pub fn score(
        &self,
        pack: &TrainingPackRecord,
        weaknesses: &[DetectedWeakness],
        skill_tier: SkillTier,
        history: &[TrainingSessionRecord],
    ) -> RecommendationScore {
        let relevance = relevance_score(pack, weaknesses);
        let difficulty_match = difficulty_score(pack.skill_tier, skill_tier);
        let quality = quality_score(pack);
        let preference = preference_score(pack, history);

        let total = relevance * WEIGHT_RELEVANCE
            + difficulty_match * WEIGHT_DIFFICULTY
            + quality * WEIGHT_QUALITY
            + preference * WEIGHT_PREFERENCE;

        let reasoning =
            reasoning(pack, weaknesses, relevance, difficulty_match, quality);

        RecommendationScore {
            pack_id: pack.id.clone(),
            name: pack.name.clone(),
            code: pack.code.clone(),
            category: pack.category.clone(),
            skill_tier: pack.skill_tier,
            difficulty: pack.difficulty,
            relevance,
            difficulty_match,
            quality,
            preference,
            total,
            reasoning,
        }
    }

    /// Rank the catalog for a player. Packs scoring zero are dropped; when
    /// `diversify` is set and candidates exceed `k`, a two-pass greedy filter
    /// spreads the result across distinct categories before back-filling by
    /// raw score.
    pub fn recommend(
        &self,
        packs: &[TrainingPackRecord],
        weaknesses: &[DetectedWeakness],
        skill_tier: SkillTier,
        history: &[TrainingSessionRecord],
        k: usize,
        diversify: bool,
    ) -> Vec<RecommendationScore> {
        let mut scored: Vec<RecommendationScore> = packs
            .iter()
            .filter(|p| p.is_active)
            .map(|p| self.score(p, weaknesses, skill_tier, history))
            .filter(|s| s.total > 0.0)
            .collect();

        scored.sort_by(|a, b| b.total.total_cmp(&a.total).then(a.pack_id.cmp(&b.pack_id)));

        if diversify && scored.len() > k {
            scored = diversity_filter(scored, k);
        }
        scored.truncate(k);
        scored
    }
}

fn relevance_score(pack: &TrainingPackRecord, weaknesses: &[DetectedWeakness]) -> f64 {
    let mut score = 0.0;
    for weakness in weaknesses {
        let relevant = relevant_categories(weakness.category);
        if relevant.is_empty() {
            continue;
        }
        if relevant.contains(&pack.category.as_str()) {
            score += weakness.confidence;
        } else if pack.tags.iter().any(|t| relevant.contains(&t.as_str())) {
            score += weakness.confidence * 0.7;
        } else if pack
            .subcategory
            .as_deref()
            .is_some_and(|sub| relevant.iter().any(|cat| sub.contains(cat)))
        {
            score += weakness.confidence * 0.5;
        }
    }
    score.min(1.0)
}

/// Symmetric distance on the 7-tier ladder.
fn difficulty_score(pack_tier: SkillTier, player_tier: SkillTier) -> f64 {
    let diff = pack_tier.rank_index().abs_diff(player_tier.rank_index());
    match diff {
        0 => 1.0,
        1 => 0.8,
        2 => 0.5,
        _ => 0.2,
    }
}

fn quality_score(pack: &TrainingPackRecord) -> f64 {
    let mut score = 0.0;
    if pack.rating > 0.0 && pack.rating_count > 0 {
        let rating = (pack.rating / 5.0).clamp(0.0, 1.0);
        // More ratings make the average trustworthy.
        let weight = (pack.rating_count as f64 / 1000.0).min(1.0);
        score += rating * weight * 0.7;
    }
    if pack.usage_count > 0 {
        let usage = ((pack.usage_count as f64 + 1.0).log10() / 4.0).min(1.0);
        score += usage * 0.3;
    }
    if pack.is_official {
        score += 0.1;
    }
    if pack.is_featured {
        score += 0.1;
    }
    score.min(1.0)
}

fn preference_score(pack: &TrainingPackRecord, history: &[TrainingSessionRecord]) -> f64 {
    if history.is_empty() {
        return 0.5; // neutral for new users
    }
    let in_category = history.iter().filter(|s| s.category == pack.category).count();
    if in_category == 0 {
        return 0.3; // untried category
    }
    (in_category as f64 / history.len() as f64 * 2.0).min(1.0)
}

fn reasoning(
    pack: &TrainingPackRecord,
    weaknesses: &[DetectedWeakness],
    relevance: f64,
    difficulty: f64,
    quality: f64,
) -> Vec<String> {
    let mut out = Vec::new();
    if relevance > 0.7 {
        let addressed: Vec<&str> = weaknesses
            .iter()
            .filter(|w| relevant_categories(w.category).contains(&pack.category.as_str()))
            .map(|w| w.category.as_str())
            .collect();
        if !addressed.is_empty() {
            out.push(format!("Directly addresses your weakness in {}", addressed.join(", ")));
        }
    }
    if difficulty > 0.8 {
        out.push("Perfect difficulty match for your skill level".to_string());
    } else if difficulty > 0.6 {
        out.push("Good difficulty progression for improvement".to_string());
    }
    if quality > 0.8 {
        out.push(format!(
            "Highly rated pack ({:.1}/5.0 from {} users)",
            pack.rating, pack.rating_count
        ));
    }
    if pack.is_official {
        out.push("Official training pack".to_string());
    }
    if pack.is_featured {
        out.push("Community featured pack".to_string());
    }
    out
}

/// Pass 1 keeps the best pack per distinct category; pass 2 back-fills any
/// remaining slots by raw score.
fn diversity_filter(scored: Vec<RecommendationScore>, k: usize) -> Vec<RecommendationScore> {
    let mut picked: Vec<RecommendationScore> = Vec::with_capacity(k);
    let mut used_categories: Vec<String> = Vec::new();
    let mut picked_ids: Vec<PackId> = Vec::new();

    for candidate in &scored {
        if !used_categories.contains(&candidate.category) {
            used_categories.push(candidate.category.clone());
            picked_ids.push(candidate.pack_id.clone());
            picked.push(candidate.clone());
            if picked.len() >= k {
                return picked;
            }
        }
    }

    for candidate in scored {
        if picked.len() >= k {
            break;
        }
        if !picked_ids.contains(&candidate.pack_id) {
            picked_ids.push(candidate.pack_id.clone());
            picked.push(candidate);
        }
    }
    picked
}
