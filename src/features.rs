use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{CoachError, MatchId, MatchRecord, MatchResult, Result};

/// Core stats that get rolling mean/std columns.
pub const CORE_STATS: [&str; 5] = ["goals", "assists", "saves", "shots", "score"];

/// Efficiency stats that get a rolling mean column.
pub const EFFICIENCY_STATS: [&str; 3] = ["shot_accuracy", "score_efficiency", "contribution_ratio"];

/// Stats that get trend columns.
pub const TREND_STATS: [&str; 5] = ["goals", "assists", "saves", "score", "shot_accuracy"];

/// Numeric features derived from one match.
///
/// The schema is fixed: every feature is a named field, and the canonical
/// column order lives in [`FeatureVector::COLUMNS`]. A renamed or dropped
/// feature fails at compile time instead of silently defaulting to zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    // Basic counts and rates.
    pub goals: f64,
    pub assists: f64,
    pub saves: f64,
    pub shots: f64,
    pub score: f64,
    pub goals_per_minute: f64,
    pub shots_per_minute: f64,
    pub saves_per_minute: f64,
    pub match_duration_minutes: f64,
    pub is_win: f64,
    pub is_loss: f64,
    pub is_draw: f64,
    // Efficiency ratios.
    pub shot_accuracy: f64,
    pub contribution_ratio: f64,
    pub score_efficiency: f64,
    pub defensive_contribution: f64,
    // One-hot context.
    pub playlist_ranked_duels: f64,
    pub playlist_ranked_doubles: f64,
    pub playlist_ranked_standard: f64,
    pub playlist_casual: f64,
    pub match_length_short: f64,
    pub match_length_normal: f64,
    pub match_length_long: f64,
    pub score_differential: f64,
    pub close_match: f64,
    // Advanced stats, zero when the replay did not carry them.
    pub boost_usage: f64,
    pub boost_efficiency: f64,
    pub average_speed: f64,
    pub time_on_ground: f64,
    pub time_low_air: f64,
    pub time_high_air: f64,
    pub aerial_tendency: f64,
}

impl FeatureVector {
    pub const WIDTH: usize = 32;

    pub const COLUMNS: [&'static str; Self::WIDTH] = [
        "goals",
        "assists",
        "saves",
        "shots",
        "score",
        "goals_per_minute",
        "shots_per_minute",
        "saves_per_minute",
        "match_duration_minutes",
        "is_win",
        "is_loss",
        "is_draw",
        "shot_accuracy",
        "contribution_ratio",
        "score_efficiency",
        "defensive_contribution",
        "playlist_ranked_duels",
        "playlist_ranked_doubles",
        "playlist_ranked_standard",
        "playlist_casual",
        "match_length_short",
        "match_length_normal",
        "match_length_long",
        "score_differential",
        "close_match",
        "boost_usage",
        "boost_efficiency",
        "average_speed",
        "time_on_ground",
        "time_low_air",
        "time_high_air",
        "aerial_tendency",
    ];

    /// Values in [`Self::COLUMNS`] order.
    pub fn as_row(&self) -> [f64; Self::WIDTH] {
        [
            self.goals,
            self.assists,
            self.saves,
            self.shots,
            self.score,
            self.goals_per_minute,
            self.shots_per_minute,
            self.saves_per_minute,
            self.match_duration_minutes,
            self.is_win,
            self.is_loss,
            self.is_draw,
            self.shot_accuracy,
            self.contribution_ratio,
            self.score_efficiency,
            self.defensive_contribution,
            self.playlist_ranked_duels,
            self.playlist_ranked_doubles,
            self.playlist_ranked_standard,
            self.playlist_casual,
            self.match_length_short,
            self.match_length_normal,
            self.match_length_long,
            self.score_differential,
            self.close_match,
            self.boost_usage,
            self.boost_efficiency,
            self.average_speed,
            self.time_on_ground,
            self.time_low_air,
            self.time_high_air,
            self.aerial_tendency,
        ]
    }

    pub fn get(&self, column: &str) -> Option<f64> {
        let idx = Self::COLUMNS.iter().position(|c| *c == column)?;
        Some(self.as_row()[idx])
    }
}

/// Extract the feature vector for a single match. Pure: no I/O, no state.
///
/// Rate denominators are floored at one minute so zero-duration records
/// (abandoned matches, truncated replays) still produce finite features.
pub fn extract(m: &MatchRecord) -> Result<FeatureVector> {
    validate_advanced(m)?;

    let minutes = m.rate_minutes();
    let mut f = FeatureVector {
        goals: m.goals as f64,
        assists: m.assists as f64,
        saves: m.saves as f64,
        shots: m.shots as f64,
        score: m.score as f64,
        goals_per_minute: m.goals as f64 / minutes,
        shots_per_minute: m.shots as f64 / minutes,
        saves_per_minute: m.saves as f64 / minutes,
        match_duration_minutes: m.duration_minutes(),
        is_win: if m.result == MatchResult::Win { 1.0 } else { 0.0 },
        is_loss: if m.result == MatchResult::Loss { 1.0 } else { 0.0 },
        is_draw: if m.result == MatchResult::Draw { 1.0 } else { 0.0 },
        ..FeatureVector::default()
    };

    // Efficiency ratios.
    if m.shots > 0 {
        f.shot_accuracy = m.goals as f64 / m.shots as f64;
    }
    let team_score = if m.result == MatchResult::Loss {
        m.score_team_1
    } else {
        m.score_team_0
    };
    if team_score > 0 {
        f.contribution_ratio = (m.goals + m.assists) as f64 / team_score as f64;
    }
    f.score_efficiency = m.score as f64 / minutes;
    f.defensive_contribution = m.saves as f64 / minutes;

    // Playlist one-hot.
    match m.playlist.as_str() {
        "Ranked Duels" => f.playlist_ranked_duels = 1.0,
        "Ranked Doubles" => f.playlist_ranked_doubles = 1.0,
        "Ranked Standard" => f.playlist_ranked_standard = 1.0,
        "Casual" => f.playlist_casual = 1.0,
        _ => {}
    }

    // Match-length buckets.
    let raw_minutes = m.duration_minutes();
    if raw_minutes <= 4.0 {
        f.match_length_short = 1.0;
    } else if raw_minutes <= 7.0 {
        f.match_length_normal = 1.0;
    } else {
        f.match_length_long = 1.0;
    }

    let diff = (m.score_team_0 - m.score_team_1).abs();
    f.score_differential = diff as f64;
    f.close_match = if diff <= 1 { 1.0 } else { 0.0 };

    // Advanced stats default to zero when the replay lacks them.
    if let Some(boost) = m.boost_usage {
        f.boost_usage = boost;
        f.boost_efficiency = m.score as f64 / boost.max(1.0);
    }
    f.average_speed = m.average_speed.unwrap_or(0.0);
    f.time_on_ground = m.time_on_ground.unwrap_or(0.0);
    f.time_low_air = m.time_low_air.unwrap_or(0.0);
    if let Some(high_air) = m.time_high_air {
        f.time_high_air = high_air;
        f.aerial_tendency = high_air / (m.duration_seconds as f64).max(1.0);
    }

    Ok(f)
}

fn validate_advanced(m: &MatchRecord) -> Result<()> {
    let checks = [
        ("boost_usage", m.boost_usage),
        ("average_speed", m.average_speed),
        ("time_on_ground", m.time_on_ground),
        ("time_low_air", m.time_low_air),
        ("time_high_air", m.time_high_air),
    ];
    for (name, value) in checks {
        if let Some(v) = value
            && (!v.is_finite() || v < 0.0)
        {
            return Err(CoachError::FeatureExtraction {
                match_id: m.id.clone(),
                message: format!("{name} is malformed: {v}"),
            });
        }
    }
    Ok(())
}

/// Per-match feature rows for a player's history, with rolling and trend
/// columns appended. Rows are ordered by match date ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureTable {
    match_ids: Vec<MatchId>,
    dates: Vec<DateTime<Utc>>,
    columns: Vec<String>,
    /// Column-major: `series[col][row]`.
    series: Vec<Vec<f64>>,
}

impl FeatureTable {
    pub fn n_rows(&self) -> usize {
        self.match_ids.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn match_ids(&self) -> &[MatchId] {
        &self.match_ids
    }

    pub fn dates(&self) -> &[DateTime<Utc>] {
        &self.dates
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(&self.series[idx])
    }

    /// One row in column order.
    pub fn row(&self, idx: usize) -> Vec<f64> {
        self.series.iter().map(|col| col[idx]).collect()
    }

    /// Row-major copy of the full table, for model input.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.n_rows()).map(|i| self.row(i)).collect()
    }
}

/// Extract features for a match history and append rolling/trend columns.
///
/// `window` is the configured rolling window; the effective window is
/// `min(window, sample count)`.
pub fn extract_history(matches: &[MatchRecord], window: usize) -> Result<FeatureTable> {
    if matches.is_empty() {
        log::warn!("no matches provided for feature extraction");
        return Ok(FeatureTable {
            match_ids: Vec::new(),
            dates: Vec::new(),
            columns: FeatureVector::COLUMNS.iter().map(|c| c.to_string()).collect(),
            series: vec![Vec::new(); FeatureVector::WIDTH],
        });
    }

    // Date order, tie-broken by match id so equal timestamps stay stable.
    let mut order: Vec<usize> = (0..matches.len()).collect();
    order.sort_by(|&a, &b| {
        matches[a]
            .match_date
            .cmp(&matches[b].match_date)
            .then_with(|| matches[a].id.0.cmp(&matches[b].id.0))
    });

    let vectors = order
        .par_iter()
        .map(|&i| extract(&matches[i]))
        .collect::<Result<Vec<_>>>()?;

    let n = vectors.len();
    let mut columns: Vec<String> = FeatureVector::COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut series: Vec<Vec<f64>> = vec![Vec::with_capacity(n); FeatureVector::WIDTH];
    for v in &vectors {
        for (col, value) in v.as_row().into_iter().enumerate() {
            series[col].push(value);
        }
    }

    let base = FeatureTable {
        match_ids: order.iter().map(|&i| matches[i].id.clone()).collect(),
        dates: order.iter().map(|&i| matches[i].match_date).collect(),
        columns: columns.clone(),
        series: series.clone(),
    };

    let w = window.max(1).min(n);
    for stat in CORE_STATS {
        let values = base.column(stat).unwrap_or(&[]);
        columns.push(format!("{stat}_avg_{w}"));
        series.push(rolling_mean(values, w));
        columns.push(format!("{stat}_std_{w}"));
        series.push(rolling_std(values, w));
    }
    for stat in EFFICIENCY_STATS {
        let values = base.column(stat).unwrap_or(&[]);
        columns.push(format!("{stat}_avg_{w}"));
        series.push(rolling_mean(values, w));
    }

    if n >= 2 {
        for stat in TREND_STATS {
            let values = base.column(stat).unwrap_or(&[]);
            columns.push(format!("{stat}_trend"));
            series.push(diff_trend(values));
            columns.push(format!("{stat}_recent_vs_historical"));
            series.push(vec![recent_vs_historical(values); n]);
        }
    }

    Ok(FeatureTable {
        match_ids: base.match_ids,
        dates: base.dates,
        columns,
        series,
    })
}

/// Trailing-window mean with a minimum period of one sample.
fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let start = (i + 1).saturating_sub(window);
            mean(&values[start..=i])
        })
        .collect()
}

/// Trailing-window sample standard deviation; single-sample windows yield 0.
fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let start = (i + 1).saturating_sub(window);
            sample_std(&values[start..=i])
        })
        .collect()
}

/// Mean of the last up-to-3 first differences at each position; positions
/// with no preceding sample yield 0.
fn diff_trend(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(2).max(1);
            if i < 1 {
                return 0.0;
            }
            let diffs: Vec<f64> = (lo..=i).map(|j| values[j] - values[j - 1]).collect();
            mean(&diffs)
        })
        .collect()
}

/// Mean of the most recent 3 samples minus the mean of everything earlier.
/// Requires at least 5 samples, otherwise 0.
fn recent_vs_historical(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 5 {
        return 0.0;
    }
    let recent = mean(&values[n - 3..]);
    let historical = mean(&values[..n - 3]);
    recent - historical
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
