//! Match-history skill coaching for Rocket League players.
//!
//! Analyzes a player's historical match statistics to detect skill weaknesses
//! and recommend practice content. The serving pipeline is built from a
//! feature-engineering stage, a weakness classifier, a skill percentile
//! analyzer and a multi-factor recommendation scorer, guarded by a lazy model
//! registry, a read-through result cache and a sliding-window rate limiter.

pub mod cache;
pub mod config;
pub mod detector;
pub mod features;
pub mod forest;
pub mod kv;
pub mod labels;
pub mod preprocess;
pub mod ratelimit;
pub mod recommend;
pub mod registry;
pub mod service;
pub mod skills;
pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::RateLimitInfo;

/// Unique identifier for a player account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(raw: &str) -> Self {
        UserId(raw.to_string())
    }
}

/// Unique identifier for a played match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchId(pub String);

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MatchId {
    fn from(raw: &str) -> Self {
        MatchId(raw.to_string())
    }
}

/// Unique identifier for a training pack in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackId(pub String);

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The eight gameplay skill dimensions used for weakness detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillCategory {
    Mechanical,
    Positioning,
    GameSense,
    BoostManagement,
    Rotation,
    AerialAbility,
    Shooting,
    Defending,
}

impl SkillCategory {
    pub const ALL: [SkillCategory; 8] = [
        SkillCategory::Mechanical,
        SkillCategory::Positioning,
        SkillCategory::GameSense,
        SkillCategory::BoostManagement,
        SkillCategory::Rotation,
        SkillCategory::AerialAbility,
        SkillCategory::Shooting,
        SkillCategory::Defending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkillCategory::Mechanical => "mechanical",
            SkillCategory::Positioning => "positioning",
            SkillCategory::GameSense => "game_sense",
            SkillCategory::BoostManagement => "boost_management",
            SkillCategory::Rotation => "rotation",
            SkillCategory::AerialAbility => "aerial_ability",
            SkillCategory::Shooting => "shooting",
            SkillCategory::Defending => "defending",
        }
    }

    /// Stable index into [`SkillCategory::ALL`], used as the class label.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|c| c == self).unwrap_or(0)
    }
}

impl fmt::Display for SkillCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Competitive rank ladder, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
    Champion,
    GrandChampion,
}

impl SkillTier {
    pub const ALL: [SkillTier; 7] = [
        SkillTier::Bronze,
        SkillTier::Silver,
        SkillTier::Gold,
        SkillTier::Platinum,
        SkillTier::Diamond,
        SkillTier::Champion,
        SkillTier::GrandChampion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkillTier::Bronze => "bronze",
            SkillTier::Silver => "silver",
            SkillTier::Gold => "gold",
            SkillTier::Platinum => "platinum",
            SkillTier::Diamond => "diamond",
            SkillTier::Champion => "champion",
            SkillTier::GrandChampion => "grand_champion",
        }
    }

    /// Position on the ordered ladder (bronze = 0).
    pub fn rank_index(&self) -> usize {
        Self::ALL.iter().position(|t| t == self).unwrap_or(3)
    }

    pub fn parse(raw: &str) -> Option<SkillTier> {
        let s = raw.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for SkillTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Final result of a match from the analyzed player's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchResult {
    Win,
    Loss,
    Draw,
}

/// One played game, as produced by the replay-ingestion collaborator.
///
/// The serving pipeline never mutates these; `processed` marks records whose
/// statistics passed ingestion validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: MatchId,
    pub user_id: UserId,
    pub playlist: String,
    pub duration_seconds: u32,
    pub match_date: DateTime<Utc>,
    pub score_team_0: i32,
    pub score_team_1: i32,
    pub result: MatchResult,
    pub goals: u32,
    pub assists: u32,
    pub saves: u32,
    pub shots: u32,
    pub score: u32,
    #[serde(default)]
    pub boost_usage: Option<f64>,
    #[serde(default)]
    pub average_speed: Option<f64>,
    #[serde(default)]
    pub time_on_ground: Option<f64>,
    #[serde(default)]
    pub time_low_air: Option<f64>,
    #[serde(default)]
    pub time_high_air: Option<f64>,
    pub processed: bool,
}

impl MatchRecord {
    /// Raw match length in minutes.
    pub fn duration_minutes(&self) -> f64 {
        self.duration_seconds as f64 / 60.0
    }

    /// Match length floored at one minute, for rate denominators.
    pub fn rate_minutes(&self) -> f64 {
        self.duration_minutes().max(1.0)
    }

    pub fn is_win(&self) -> bool {
        self.result == MatchResult::Win
    }
}

/// Library-wide errors.
#[derive(Debug, Error)]
pub enum CoachError {
    #[error("insufficient match data: have {available}, need {required}")]
    InsufficientData { required: usize, available: usize },

    #[error("model '{0}' has not been trained")]
    ModelNotTrained(String),

    #[error("failed to load model '{model}': {message}")]
    ModelLoad { model: String, message: String },

    #[error("feature extraction failed for match {match_id}: {message}")]
    FeatureExtraction { match_id: MatchId, message: String },

    #[error("preprocessor used before fit")]
    SchemaNotFitted,

    #[error("rate limit exceeded: retry after {}s", .0.retry_after.unwrap_or(0))]
    RateLimited(RateLimitInfo),

    #[error("backing store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoachError {
    /// Wrap an arbitrary failure in the stable generic envelope, truncating
    /// oversized context so the message stays loggable.
    pub fn internal(context: &str, detail: impl fmt::Display) -> Self {
        let mut msg = format!("{context}: {detail}");
        if msg.len() > 300 {
            msg.truncate(300);
            msg.push_str("...");
        }
        CoachError::Internal(msg)
    }

    /// Whether the error is user-actionable rather than a service fault.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            CoachError::InsufficientData { .. } | CoachError::RateLimited(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoachError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skill_category_index_round_trips() {
        for cat in SkillCategory::ALL {
            assert_eq!(SkillCategory::ALL[cat.index()], cat);
        }
    }

    #[test]
    fn skill_tier_parses_ladder_names() {
        assert_eq!(SkillTier::parse("Grand_Champion"), Some(SkillTier::GrandChampion));
        assert_eq!(SkillTier::parse(" gold "), Some(SkillTier::Gold));
        assert_eq!(SkillTier::parse("unranked"), None);
    }

    #[test]
    fn tier_order_matches_rank_index() {
        assert!(SkillTier::Bronze < SkillTier::GrandChampion);
        assert_eq!(SkillTier::Bronze.rank_index(), 0);
        assert_eq!(SkillTier::GrandChampion.rank_index(), 6);
    }

    #[test]
    fn internal_error_truncates_context() {
        let long = "x".repeat(1000);
        let err = CoachError::internal("boom", long);
        let msg = err.to_string();
        assert!(msg.len() < 350);
    }

    #[test]
    fn rate_minutes_floors_zero_duration() {
        let m = MatchRecord {
            id: "m1".into(),
            user_id: "u1".into(),
            playlist: "Ranked Doubles".to_string(),
            duration_seconds: 0,
            match_date: Utc::now(),
            score_team_0: 0,
            score_team_1: 0,
            result: MatchResult::Draw,
            goals: 0,
            assists: 0,
            saves: 0,
            shots: 0,
            score: 0,
            boost_usage: None,
            average_speed: None,
            time_on_ground: None,
            time_low_air: None,
            time_high_air: None,
            processed: true,
        };
        assert_eq!(m.rate_minutes(), 1.0);
    }
}
