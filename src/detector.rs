use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::CoachConfig;
use crate::features::extract_history;
use crate::forest::{ForestSettings, RandomForest};
use crate::labels::{LABEL_VERSION, bootstrap_label_v1};
use crate::preprocess::Preprocessor;
use crate::{CoachError, MatchId, MatchRecord, Result, SkillCategory};

/// Severity band derived from calibrated confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Severity::High
        } else if confidence >= 0.6 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

/// A ranked weakness call above the confidence threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryWeakness {
    pub category: SkillCategory,
    pub confidence: f64,
    pub severity: Severity,
}

/// Classifier output for one match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaknessPrediction {
    pub match_id: MatchId,
    pub primary: SkillCategory,
    pub confidence: f64,
    pub is_confident: bool,
    /// All categories at or above the confidence threshold, descending, at
    /// most three. Each category appears at most once.
    pub secondary: Vec<SecondaryWeakness>,
    pub summary: String,
}

/// Aggregated weakness finding across a window of matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryFinding {
    pub category: SkillCategory,
    pub frequency: usize,
    /// Share of analyzed matches flagging this category, in percent.
    pub share: f64,
    pub mean_confidence: f64,
    pub severity: Severity,
}

/// Aggregate weakness report for a player's recent history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaknessReport {
    pub matches_analyzed: usize,
    pub confident_predictions: usize,
    /// Findings ranked by (frequency, mean confidence) descending.
    pub findings: Vec<CategoryFinding>,
    pub recommendations: Vec<String>,
    pub overall_confidence: f64,
}

impl WeaknessReport {
    pub fn primary(&self) -> Option<&CategoryFinding> {
        self.findings.first()
    }
}

/// Metrics reported by [`WeaknessDetector::train`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub training_samples: usize,
    pub feature_count: usize,
    pub training_accuracy: f64,
    /// Accuracy on a held-out fifth of the corpus; absent below 10 samples.
    pub holdout_accuracy: Option<f64>,
    pub class_distribution: Vec<(SkillCategory, usize)>,
    pub label_version: u32,
    pub meets_accuracy_threshold: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorStatus {
    Untrained,
    Healthy,
    /// Trained, but holdout accuracy fell below the configured floor.
    Degraded,
}

/// Weakness classifier: bootstrap-labeled, class-balanced tree ensemble over
/// the engineered feature table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaknessDetector {
    feature_window: usize,
    min_matches: usize,
    min_analysis_matches: usize,
    confidence_threshold: f64,
    min_accuracy: f64,
    forest_settings: ForestSettings,
    preprocessor: Preprocessor,
    forest: Option<RandomForest>,
    status: DetectorStatus,
}

impl WeaknessDetector {
    pub fn new(config: &CoachConfig) -> Self {
        Self {
            feature_window: config.feature_window,
            min_matches: config.min_matches,
            min_analysis_matches: config.min_analysis_matches,
            confidence_threshold: config.confidence_threshold,
            min_accuracy: config.min_accuracy,
            forest_settings: ForestSettings {
                n_trees: config.forest.n_trees,
                max_depth: config.forest.max_depth,
                min_samples_split: config.forest.min_samples_split,
                min_samples_leaf: config.forest.min_samples_leaf,
                seed: config.random_state,
            },
            preprocessor: Preprocessor::new(
                config.scaler,
                config.imputation,
                config.selection_k,
                config.selection_method,
            ),
            forest: None,
            status: DetectorStatus::Untrained,
        }
    }

    pub fn status(&self) -> DetectorStatus {
        self.status
    }

    pub fn is_trained(&self) -> bool {
        self.forest.is_some()
    }

    /// Train on a corpus of processed matches using bootstrap labels.
    pub fn train(&mut self, matches: &[MatchRecord]) -> Result<TrainingSummary> {
        if matches.len() < self.min_matches {
            return Err(CoachError::InsufficientData {
                required: self.min_matches,
                available: matches.len(),
            });
        }

        let table = extract_history(matches, self.feature_window)?;
        // Rows are date-ordered, so labels are looked up per id, not by the
        // caller's ordering.
        let label_by_id: HashMap<&MatchId, usize> = matches
            .iter()
            .map(|m| (&m.id, bootstrap_label_v1(m).index()))
            .collect();
        let labels: Vec<usize> = table
            .match_ids()
            .iter()
            .map(|id| label_by_id.get(id).copied().unwrap_or(0))
            .collect();

        let matrix = self.preprocessor.fit_transform(&table, Some(&labels))?;
        let forest = RandomForest::fit(&matrix.rows, &labels, &self.forest_settings)?;
        let training_accuracy = forest.accuracy(&matrix.rows, &labels);
        let holdout_accuracy = self.holdout_accuracy(&matrix.rows, &labels);

        let mut class_distribution = Vec::new();
        for cat in SkillCategory::ALL {
            let count = labels.iter().filter(|&&y| y == cat.index()).count();
            class_distribution.push((cat, count));
        }

        let gate = holdout_accuracy.unwrap_or(training_accuracy);
        let meets = gate >= self.min_accuracy;
        self.status = if meets { DetectorStatus::Healthy } else { DetectorStatus::Degraded };
        self.forest = Some(forest);

        log::info!(
            "weakness detector trained: {} samples, {} features, accuracy {:.3}, holdout {:?}",
            matches.len(),
            matrix.n_columns(),
            training_accuracy,
            holdout_accuracy,
        );

        Ok(TrainingSummary {
            training_samples: matches.len(),
            feature_count: matrix.n_columns(),
            training_accuracy,
            holdout_accuracy,
            class_distribution,
            label_version: LABEL_VERSION,
            meets_accuracy_threshold: meets,
        })
    }

    /// Deterministic 80/20 split: every fifth row is held out and a fresh
    /// forest is trained on the rest.
    fn holdout_accuracy(&self, rows: &[Vec<f64>], labels: &[usize]) -> Option<f64> {
        if rows.len() < 10 {
            return None;
        }
        let mut train_rows = Vec::new();
        let mut train_labels = Vec::new();
        let mut held_rows = Vec::new();
        let mut held_labels = Vec::new();
        for (i, (row, &y)) in rows.iter().zip(labels).enumerate() {
            if i % 5 == 4 {
                held_rows.push(row.clone());
                held_labels.push(y);
            } else {
                train_rows.push(row.clone());
                train_labels.push(y);
            }
        }
        let forest = RandomForest::fit(&train_rows, &train_labels, &self.forest_settings).ok()?;
        Some(forest.accuracy(&held_rows, &held_labels))
    }

    /// Per-match weakness predictions for a player's history.
    pub fn predict(&self, matches: &[MatchRecord]) -> Result<Vec<WeaknessPrediction>> {
        let forest = self
            .forest
            .as_ref()
            .ok_or_else(|| CoachError::ModelNotTrained("weakness_detector".to_string()))?;
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let table = extract_history(matches, self.feature_window)?;
        let matrix = self.preprocessor.transform(&table)?;
        let proba = forest.predict_proba(&matrix.rows);

        let mut out = Vec::with_capacity(proba.len());
        for (row_idx, dist) in proba.iter().enumerate() {
            let (primary_idx, confidence) = dist
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, &p)| (i, p))
                .unwrap_or((0, 0.0));
            let primary = SkillCategory::ALL[primary_idx.min(SkillCategory::ALL.len() - 1)];

            let mut secondary: Vec<SecondaryWeakness> = dist
                .iter()
                .enumerate()
                .filter(|(_, &p)| p >= self.confidence_threshold)
                .map(|(i, &p)| SecondaryWeakness {
                    category: SkillCategory::ALL[i.min(SkillCategory::ALL.len() - 1)],
                    confidence: p,
                    severity: Severity::from_confidence(p),
                })
                .collect();
            secondary.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            secondary.truncate(3);

            let is_confident = confidence >= self.confidence_threshold;
            let summary = prediction_summary(primary, confidence, is_confident, &secondary);

            out.push(WeaknessPrediction {
                match_id: table.match_ids()[row_idx].clone(),
                primary,
                confidence,
                is_confident,
                secondary,
                summary,
            });
        }
        Ok(out)
    }

    /// Aggregate analysis of a player's recent matches: per-match predictions
    /// grouped by category and ranked by (frequency, mean confidence).
    pub fn analyze(&self, matches: &[MatchRecord]) -> Result<WeaknessReport> {
        if matches.len() < self.min_analysis_matches {
            return Err(CoachError::InsufficientData {
                required: self.min_analysis_matches,
                available: matches.len(),
            });
        }
        let predictions = self.predict(matches)?;
        if predictions.is_empty() {
            return Err(CoachError::InsufficientData {
                required: self.min_analysis_matches,
                available: 0,
            });
        }

        let mut grouped: HashMap<SkillCategory, Vec<f64>> = HashMap::new();
        for p in &predictions {
            grouped.entry(p.primary).or_default().push(p.confidence);
        }

        let total = predictions.len();
        let mut findings: Vec<CategoryFinding> = grouped
            .into_iter()
            .map(|(category, confidences)| {
                let mean = crate::features::mean(&confidences);
                CategoryFinding {
                    category,
                    frequency: confidences.len(),
                    share: confidences.len() as f64 / total as f64 * 100.0,
                    mean_confidence: mean,
                    severity: Severity::from_confidence(mean),
                }
            })
            .collect();
        findings.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then(b.mean_confidence.total_cmp(&a.mean_confidence))
                .then(a.category.cmp(&b.category))
        });

        let recommendations = improvement_recommendations(&findings);
        let overall_confidence =
            crate::features::mean(&predictions.iter().map(|p| p.confidence).collect::<Vec<_>>());

        Ok(WeaknessReport {
            matches_analyzed: matches.len(),
            confident_predictions: predictions.iter().filter(|p| p.is_confident).count(),
            findings,
            recommendations,
            overall_confidence,
        })
    }
}

fn prediction_summary(
    primary: SkillCategory,
    confidence: f64,
    is_confident: bool,
    secondary: &[SecondaryWeakness],
) -> String {
    if !is_confident {
        return "Analysis shows mixed performance across skill areas. Consider focusing on \
                fundamental mechanics."
            .to_string();
    }
    let severity = Severity::from_confidence(confidence);
    if secondary.len() <= 1 {
        format!(
            "Primary weakness identified in {primary} with {} confidence. Focus training on this area.",
            severity.as_str()
        )
    } else {
        let others: Vec<&str> =
            secondary[1..].iter().take(2).map(|w| w.category.as_str()).collect();
        format!(
            "Primary weakness in {primary} ({} confidence). Also consider improving {}.",
            severity.as_str(),
            others.join(", ")
        )
    }
}

fn improvement_recommendations(findings: &[CategoryFinding]) -> Vec<String> {
    let Some(top) = findings.first() else {
        return vec!["Continue practicing to gather more performance data.".to_string()];
    };

    let mut out = Vec::new();
    if top.mean_confidence >= 0.7 {
        out.push(focus_text(top.category).to_string());
    }
    if let Some(second) = findings.get(1) {
        out.push(format!(
            "Secondary focus: work on {} skills in practice sessions.",
            second.category
        ));
    }
    if out.is_empty() {
        out.push("Continue practicing to gather more performance data.".to_string());
    }
    out
}

fn focus_text(category: SkillCategory) -> &'static str {
    match category {
        SkillCategory::Shooting => {
            "Focus on shooting accuracy training packs and free play shooting drills."
        }
        SkillCategory::Defending => {
            "Practice save training packs and defensive positioning drills."
        }
        SkillCategory::BoostManagement => {
            "Work on boost efficiency and collection route optimization."
        }
        SkillCategory::Mechanical => {
            "Focus on fundamental mechanics: ball control, car control, and consistency."
        }
        SkillCategory::Positioning => {
            "Study rotation patterns and practice positioning in different game scenarios."
        }
        SkillCategory::AerialAbility => {
            "Practice aerial training packs and air roll control exercises."
        }
        SkillCategory::GameSense => {
            "Focus on decision-making drills and game awareness exercises."
        }
        SkillCategory::Rotation => {
            "Drill back-post rotation and third-man timing in team playlists."
        }
    }
}
