use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::config::CoachConfig;
use crate::features::{FeatureTable, extract_history, mean, sample_std};
use crate::{CoachError, MatchRecord, Result, SkillCategory, SkillTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

/// Least-squares trend of one feature over the match sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureTrend {
    pub direction: TrendDirection,
    pub slope: f64,
    /// Absolute Pearson correlation of the fit.
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStats {
    pub feature: String,
    pub current: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub percentile: f64,
    pub trend: FeatureTrend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillClassification {
    Strength,
    Weakness,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryTrend {
    pub direction: TrendDirection,
    pub improvement: f64,
    pub improvement_pct: f64,
    pub recent_average: f64,
    pub historical_average: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryAssessment {
    pub category: SkillCategory,
    /// Mean of the category's feature percentiles, 0-100.
    pub score: f64,
    pub classification: SkillClassification,
    pub features: Vec<FeatureStats>,
    pub trend: CategoryTrend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallMetrics {
    pub win_rate: f64,
    pub average_score: f64,
    pub goals_per_match: f64,
    pub assists_per_match: f64,
    pub saves_per_match: f64,
    pub shot_accuracy: f64,
    /// 1 minus the coefficient of variation of match score.
    pub consistency_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallTrend {
    pub direction: TrendDirection,
    pub improving_features: usize,
    pub declining_features: usize,
    pub stable_features: usize,
}

/// Per-category skill assessment for a player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillReport {
    pub matches_analyzed: usize,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub categories: Vec<CategoryAssessment>,
    pub strengths: Vec<SkillCategory>,
    pub weaknesses: Vec<SkillCategory>,
    pub balanced: Vec<SkillCategory>,
    pub overall: OverallMetrics,
    pub overall_trend: OverallTrend,
}

struct Benchmark {
    category: SkillCategory,
    feature: &'static str,
    /// Tier thresholds in ladder order bronze..diamond.
    tiers: [(SkillTier, f64); 5],
    lower_is_better: bool,
}

/// Rank-tier benchmark table. Seeded from coaching heuristics; percentile
/// lookups for uncovered (category, feature) pairs fall back to 50.
static BENCHMARKS: Lazy<Vec<Benchmark>> = Lazy::new(|| {
    use SkillCategory::*;
    use SkillTier::*;
    let ladder = |v: [f64; 5]| {
        [
            (Bronze, v[0]),
            (Silver, v[1]),
            (Gold, v[2]),
            (Platinum, v[3]),
            (Diamond, v[4]),
        ]
    };
    vec![
        Benchmark {
            category: Mechanical,
            feature: "shot_accuracy",
            tiers: ladder([0.2, 0.3, 0.4, 0.5, 0.6]),
            lower_is_better: false,
        },
        Benchmark {
            category: Mechanical,
            feature: "goals_per_minute",
            tiers: ladder([0.3, 0.4, 0.5, 0.6, 0.7]),
            lower_is_better: false,
        },
        Benchmark {
            category: Shooting,
            feature: "shot_accuracy",
            tiers: ladder([0.2, 0.3, 0.4, 0.5, 0.6]),
            lower_is_better: false,
        },
        Benchmark {
            category: Defending,
            feature: "defensive_contribution",
            tiers: ladder([0.3, 0.4, 0.5, 0.6, 0.7]),
            lower_is_better: false,
        },
        Benchmark {
            category: Positioning,
            feature: "average_speed",
            tiers: ladder([800.0, 900.0, 1000.0, 1100.0, 1200.0]),
            lower_is_better: false,
        },
        Benchmark {
            category: Positioning,
            feature: "time_on_ground",
            tiers: ladder([0.7, 0.65, 0.6, 0.55, 0.5]),
            lower_is_better: true,
        },
        Benchmark {
            category: BoostManagement,
            feature: "boost_efficiency",
            tiers: ladder([50.0, 75.0, 100.0, 125.0, 150.0]),
            lower_is_better: false,
        },
        Benchmark {
            category: AerialAbility,
            feature: "aerial_tendency",
            tiers: ladder([0.1, 0.15, 0.2, 0.25, 0.3]),
            lower_is_better: false,
        },
        Benchmark {
            category: AerialAbility,
            feature: "time_high_air",
            tiers: ladder([0.05, 0.08, 0.12, 0.15, 0.2]),
            lower_is_better: false,
        },
    ]
});

/// Percentile for a feature value against the tier benchmarks; 50 when the
/// (category, feature) pair has no benchmark.
pub fn percentile_for(category: SkillCategory, feature: &str, value: f64) -> f64 {
    let Some(bench) = BENCHMARKS
        .iter()
        .find(|b| b.category == category && b.feature == feature)
    else {
        return 50.0;
    };

    // Walk tiers from the top; first tier the value clears sets the bucket.
    let cleared = |threshold: f64| {
        if bench.lower_is_better { value <= threshold } else { value >= threshold }
    };
    if cleared(bench.tiers[4].1) {
        90.0
    } else if cleared(bench.tiers[3].1) {
        75.0
    } else if cleared(bench.tiers[2].1) {
        50.0
    } else if cleared(bench.tiers[1].1) {
        25.0
    } else {
        10.0
    }
}

/// Map feature columns onto skill categories via keyword tagging. Categories
/// come out in [`SkillCategory::ALL`] order; features keep column order.
pub fn category_columns(columns: &[String]) -> Vec<(SkillCategory, Vec<String>)> {
    let mut map: Vec<(SkillCategory, Vec<String>)> =
        SkillCategory::ALL.iter().map(|&c| (c, Vec::new())).collect();
    let mut push = |cat: SkillCategory, col: &str| {
        let entry = &mut map[cat.index()].1;
        if !entry.iter().any(|c| c == col) {
            entry.push(col.to_string());
        }
    };

    for col in columns {
        let name = col.to_ascii_lowercase();
        if ["goal", "shot", "accuracy"].iter().any(|k| name.contains(k)) {
            push(SkillCategory::Shooting, col);
            push(SkillCategory::Mechanical, col);
        } else if ["save", "defensive"].iter().any(|k| name.contains(k)) {
            push(SkillCategory::Defending, col);
            push(SkillCategory::Mechanical, col);
        } else if name.contains("boost") {
            push(SkillCategory::BoostManagement, col);
        } else if ["aerial", "air"].iter().any(|k| name.contains(k)) {
            push(SkillCategory::AerialAbility, col);
            push(SkillCategory::Mechanical, col);
        } else if ["assist", "contribution"].iter().any(|k| name.contains(k)) {
            push(SkillCategory::GameSense, col);
        } else if ["speed", "ground"].iter().any(|k| name.contains(k)) {
            push(SkillCategory::Positioning, col);
        }
    }

    map.into_iter().filter(|(_, cols)| !cols.is_empty()).collect()
}

/// Deterministic per-category skill analysis over a feature table. No model,
/// no randomness: identical input always yields an identical report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillAnalyzer {
    feature_window: usize,
    trend_window: usize,
}

impl SkillAnalyzer {
    pub fn new(config: &CoachConfig) -> Self {
        Self {
            feature_window: config.feature_window,
            trend_window: config.trend_window,
        }
    }

    pub fn analyze(&self, matches: &[MatchRecord]) -> Result<SkillReport> {
        if matches.is_empty() {
            return Err(CoachError::InsufficientData { required: 1, available: 0 });
        }
        let table = extract_history(matches, self.feature_window)?;
        self.analyze_table(&table, matches)
    }

    pub fn analyze_table(&self, table: &FeatureTable, matches: &[MatchRecord]) -> Result<SkillReport> {
        if table.n_rows() == 0 {
            return Err(CoachError::InsufficientData { required: 1, available: 0 });
        }

        let mut categories = Vec::new();
        for (category, columns) in category_columns(table.columns()) {
            categories.push(self.assess_category(category, &columns, table));
        }

        let (strengths, weaknesses, balanced) = classify(&mut categories);
        let overall = overall_metrics(matches);
        let overall_trend = overall_trend(table);

        let period_start =
            matches.iter().map(|m| m.match_date).min().unwrap_or_else(Utc::now);
        let period_end = matches.iter().map(|m| m.match_date).max().unwrap_or_else(Utc::now);

        Ok(SkillReport {
            matches_analyzed: matches.len(),
            period_start,
            period_end,
            categories,
            strengths,
            weaknesses,
            balanced,
            overall,
            overall_trend,
        })
    }

    fn assess_category(
        &self,
        category: SkillCategory,
        columns: &[String],
        table: &FeatureTable,
    ) -> CategoryAssessment {
        let mut features = Vec::with_capacity(columns.len());
        let mut percentiles = Vec::with_capacity(columns.len());

        for col in columns {
            let Some(values) = table.column(col) else { continue };
            if values.is_empty() {
                continue;
            }
            let current = *values.last().unwrap_or(&0.0);
            let percentile = percentile_for(category, col, current);
            percentiles.push(percentile);
            features.push(FeatureStats {
                feature: col.clone(),
                current,
                mean: mean(values),
                std_dev: sample_std(values),
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                percentile,
                trend: feature_trend(values),
            });
        }

        let score = if percentiles.is_empty() { 0.0 } else { mean(&percentiles) };
        CategoryAssessment {
            category,
            score,
            // Final classification is assigned once all categories exist.
            classification: SkillClassification::Balanced,
            trend: self.category_trend(columns, table),
            features,
        }
    }

    /// Recent-vs-historical comparison of the category's feature-average
    /// series.
    fn category_trend(&self, columns: &[String], table: &FeatureTable) -> CategoryTrend {
        let n = table.n_rows();
        let series: Vec<f64> = (0..n)
            .map(|row| {
                let vals: Vec<f64> = columns
                    .iter()
                    .filter_map(|c| table.column(c).map(|s| s[row]))
                    .collect();
                mean(&vals)
            })
            .collect();

        if series.len() < 2 {
            return CategoryTrend {
                direction: TrendDirection::InsufficientData,
                improvement: 0.0,
                improvement_pct: 0.0,
                recent_average: series.first().copied().unwrap_or(0.0),
                historical_average: series.first().copied().unwrap_or(0.0),
            };
        }

        let w = self.trend_window.max(1).min(series.len());
        let recent = mean(&series[series.len() - w..]);
        let historical = if series.len() > w {
            mean(&series[..series.len() - w])
        } else {
            recent
        };
        let improvement = recent - historical;
        let improvement_pct = improvement / historical.abs().max(0.001) * 100.0;
        let direction = if improvement > 0.0 {
            TrendDirection::Improving
        } else if improvement < 0.0 {
            TrendDirection::Declining
        } else {
            TrendDirection::Stable
        };
        CategoryTrend {
            direction,
            improvement,
            improvement_pct,
            recent_average: recent,
            historical_average: historical,
        }
    }
}

/// Linear-regression trend: stable when the slope is smaller than its own
/// standard error, confidence = |Pearson r|.
pub fn feature_trend(values: &[f64]) -> FeatureTrend {
    let n = values.len();
    if n < 2 {
        return FeatureTrend {
            direction: TrendDirection::InsufficientData,
            slope: 0.0,
            confidence: 0.0,
        };
    }

    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let x_mean = mean(&xs);
    let y_mean = mean(values);

    let sxx: f64 = xs.iter().map(|x| (x - x_mean).powi(2)).sum();
    let sxy: f64 = xs.iter().zip(values).map(|(x, y)| (x - x_mean) * (y - y_mean)).sum();
    let syy: f64 = values.iter().map(|y| (y - y_mean).powi(2)).sum();

    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let r = if sxx > 0.0 && syy > 0.0 { sxy / (sxx * syy).sqrt() } else { 0.0 };

    // Standard error of the slope estimate.
    let std_err = if n > 2 && sxx > 0.0 {
        let sse: f64 = xs
            .iter()
            .zip(values)
            .map(|(x, y)| {
                let fitted = y_mean + slope * (x - x_mean);
                (y - fitted).powi(2)
            })
            .sum();
        (sse / (n as f64 - 2.0) / sxx).sqrt()
    } else {
        0.0
    };

    let direction = if slope == 0.0 || slope.abs() < std_err {
        TrendDirection::Stable
    } else if slope > 0.0 {
        TrendDirection::Improving
    } else {
        TrendDirection::Declining
    };

    FeatureTrend { direction, slope, confidence: r.abs() }
}

/// Top quartile with score >= 70 is a strength, bottom quartile with
/// score <= 40 a weakness, everything else balanced.
fn classify(
    categories: &mut [CategoryAssessment],
) -> (Vec<SkillCategory>, Vec<SkillCategory>, Vec<SkillCategory>) {
    let mut order: Vec<usize> = (0..categories.len()).collect();
    order.sort_by(|&a, &b| {
        categories[b]
            .score
            .total_cmp(&categories[a].score)
            .then(categories[a].category.cmp(&categories[b].category))
    });

    let n = order.len();
    let quartile = (n / 4).max(1);
    let mut strengths = Vec::new();
    let mut weaknesses = Vec::new();
    let mut balanced = Vec::new();

    for (rank, &idx) in order.iter().enumerate() {
        let score = categories[idx].score;
        let class = if rank < quartile && score >= 70.0 {
            SkillClassification::Strength
        } else if rank >= n.saturating_sub(quartile) && score <= 40.0 {
            SkillClassification::Weakness
        } else {
            SkillClassification::Balanced
        };
        categories[idx].classification = class;
        match class {
            SkillClassification::Strength => strengths.push(categories[idx].category),
            SkillClassification::Weakness => weaknesses.push(categories[idx].category),
            SkillClassification::Balanced => balanced.push(categories[idx].category),
        }
    }
    (strengths, weaknesses, balanced)
}

fn overall_metrics(matches: &[MatchRecord]) -> OverallMetrics {
    let n = matches.len().max(1) as f64;
    let scores: Vec<f64> = matches.iter().map(|m| m.score as f64).collect();
    let total_goals: u32 = matches.iter().map(|m| m.goals).sum();
    let total_shots: u32 = matches.iter().map(|m| m.shots).sum();
    let avg_score = mean(&scores);

    let consistency = if matches.len() > 1 {
        1.0 - sample_std(&scores) / avg_score.max(1.0)
    } else {
        1.0
    };

    OverallMetrics {
        win_rate: matches.iter().filter(|m| m.is_win()).count() as f64 / n,
        average_score: avg_score,
        goals_per_match: total_goals as f64 / n,
        assists_per_match: matches.iter().map(|m| m.assists).sum::<u32>() as f64 / n,
        saves_per_match: matches.iter().map(|m| m.saves).sum::<u32>() as f64 / n,
        shot_accuracy: total_goals as f64 / total_shots.max(1) as f64,
        consistency_score: consistency,
    }
}

fn overall_trend(table: &FeatureTable) -> OverallTrend {
    let key_features = ["goals", "assists", "saves", "shot_accuracy", "score"];
    let mut improving = 0;
    let mut declining = 0;
    let mut stable = 0;
    for feature in key_features {
        let Some(values) = table.column(feature) else { continue };
        match feature_trend(values).direction {
            TrendDirection::Improving => improving += 1,
            TrendDirection::Declining => declining += 1,
            _ => stable += 1,
        }
    }
    let direction = if improving > declining {
        TrendDirection::Improving
    } else if declining > improving {
        TrendDirection::Declining
    } else {
        TrendDirection::Stable
    };
    OverallTrend {
        direction,
        improving_features: improving,
        declining_features: declining,
        stable_features: stable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MatchResult, UserId};
    use chrono::TimeZone;

    fn stub(id: &str, day: i64, goals: u32, shots: u32) -> MatchRecord {
        MatchRecord {
            id: id.into(),
            user_id: UserId("u1".to_string()),
            playlist: "Ranked Doubles".to_string(),
            duration_seconds: 300,
            match_date: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
                + chrono::Duration::days(day),
            score_team_0: 3,
            score_team_1: 2,
            result: MatchResult::Win,
            goals,
            assists: 1,
            saves: 2,
            shots,
            score: 350,
            boost_usage: Some(0.5),
            average_speed: Some(1150.0),
            time_on_ground: Some(0.55),
            time_low_air: Some(0.3),
            time_high_air: Some(0.16),
            processed: true,
        }
    }

    fn history(n: usize) -> Vec<MatchRecord> {
        (0..n).map(|i| stub(&format!("m{i}"), i as i64, 2, 4)).collect()
    }

    #[test]
    fn analysis_is_deterministic() {
        let analyzer = SkillAnalyzer::new(&CoachConfig::default());
        let matches = history(8);
        let a = serde_json::to_string(&analyzer.analyze(&matches).unwrap()).unwrap();
        let b = serde_json::to_string(&analyzer.analyze(&matches).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_is_insufficient_data() {
        let analyzer = SkillAnalyzer::new(&CoachConfig::default());
        assert!(matches!(
            analyzer.analyze(&[]).unwrap_err(),
            CoachError::InsufficientData { .. }
        ));
    }

    #[test]
    fn keyword_tagging_feeds_shared_categories() {
        let columns: Vec<String> = ["goals", "saves", "boost_usage", "time_high_air", "assists"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let tagged = category_columns(&columns);
        let get = |cat: SkillCategory| {
            tagged.iter().find(|(c, _)| *c == cat).map(|(_, cols)| cols.clone()).unwrap_or_default()
        };
        assert!(get(SkillCategory::Shooting).contains(&"goals".to_string()));
        assert!(get(SkillCategory::Mechanical).contains(&"goals".to_string()));
        assert!(get(SkillCategory::Mechanical).contains(&"saves".to_string()));
        assert!(get(SkillCategory::BoostManagement).contains(&"boost_usage".to_string()));
        assert!(get(SkillCategory::AerialAbility).contains(&"time_high_air".to_string()));
        assert!(get(SkillCategory::GameSense).contains(&"assists".to_string()));
        // Rotation has no keyword sources.
        assert!(tagged.iter().all(|(c, _)| *c != SkillCategory::Rotation));
    }

    #[test]
    fn percentile_lookup_walks_tier_thresholds() {
        assert_eq!(percentile_for(SkillCategory::Mechanical, "shot_accuracy", 0.65), 90.0);
        assert_eq!(percentile_for(SkillCategory::Mechanical, "shot_accuracy", 0.45), 50.0);
        assert_eq!(percentile_for(SkillCategory::Mechanical, "shot_accuracy", 0.05), 10.0);
        // Lower-is-better benchmark.
        assert_eq!(percentile_for(SkillCategory::Positioning, "time_on_ground", 0.45), 90.0);
        assert_eq!(percentile_for(SkillCategory::Positioning, "time_on_ground", 0.9), 10.0);
        // Unknown pairs default to the median.
        assert_eq!(percentile_for(SkillCategory::Rotation, "anything", 1.0), 50.0);
    }

    #[test]
    fn improving_series_detected() {
        let values: Vec<f64> = (0..10).map(|i| i as f64 * 0.5).collect();
        let trend = feature_trend(&values);
        assert_eq!(trend.direction, TrendDirection::Improving);
        assert!((trend.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn flat_series_is_stable() {
        let trend = feature_trend(&[2.0; 6]);
        assert_eq!(trend.direction, TrendDirection::Stable);
        assert_eq!(trend.slope, 0.0);
    }

    #[test]
    fn noisy_series_with_tiny_slope_is_stable() {
        // Slope well below its standard error.
        let values = [5.0, 1.0, 6.0, 0.5, 5.5, 1.2, 6.1, 0.9];
        let trend = feature_trend(&values);
        assert_eq!(trend.direction, TrendDirection::Stable);
    }

    #[test]
    fn strong_profile_yields_high_category_scores() {
        let analyzer = SkillAnalyzer::new(&CoachConfig::default());
        // shot_accuracy 0.5, speed 1150, low ground time: upper-tier values.
        let report = analyzer.analyze(&history(6)).unwrap();
        let shooting = report
            .categories
            .iter()
            .find(|c| c.category == SkillCategory::Shooting)
            .unwrap();
        assert!(shooting.score > 50.0);
        assert!(!shooting.features.is_empty());
    }

    #[test]
    fn classification_brackets_scores() {
        let analyzer = SkillAnalyzer::new(&CoachConfig::default());
        let report = analyzer.analyze(&history(6)).unwrap();
        for cat in &report.categories {
            match cat.classification {
                SkillClassification::Strength => assert!(cat.score >= 70.0),
                SkillClassification::Weakness => assert!(cat.score <= 40.0),
                SkillClassification::Balanced => {}
            }
        }
        let listed = report.strengths.len() + report.weaknesses.len() + report.balanced.len();
        assert_eq!(listed, report.categories.len());
    }

    #[test]
    fn overall_metrics_aggregate_counts() {
        let matches = history(4);
        let m = overall_metrics(&matches);
        assert_eq!(m.win_rate, 1.0);
        assert_eq!(m.goals_per_match, 2.0);
        assert!((m.shot_accuracy - 0.5).abs() < 1e-12);
        assert_eq!(m.consistency_score, 1.0); // identical scores
    }

    #[test]
    fn single_match_trend_is_insufficient() {
        let analyzer = SkillAnalyzer::new(&CoachConfig::default());
        let report = analyzer.analyze(&history(1)).unwrap();
        for cat in &report.categories {
            assert_eq!(cat.trend.direction, TrendDirection::InsufficientData);
        }
    }
}
