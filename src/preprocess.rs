use serde::{Deserialize, Serialize};

use crate::config::{ImputeStrategy, ScalerKind, SelectionMethod};
use crate::features::FeatureTable;
use crate::forest::{ForestSettings, RandomForest};
use crate::{CoachError, Result};

/// A named, row-major numeric matrix — the model-ready output of
/// [`Preprocessor::transform`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl Matrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FittedScaler {
    Standard { means: Vec<f64>, stds: Vec<f64> },
    MinMax { mins: Vec<f64>, spans: Vec<f64> },
    Robust { medians: Vec<f64>, iqrs: Vec<f64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FittedState {
    /// Full training schema, in training column order.
    feature_names: Vec<String>,
    /// Per-column imputation values, aligned with `feature_names`.
    impute_values: Vec<f64>,
    /// Indices into `feature_names` that survived selection, ascending.
    selected: Vec<usize>,
    /// Selection score per original column (empty when selection was off).
    scores: Vec<f64>,
    scaler: FittedScaler,
}

/// Fits normalization state on training data and replays it identically at
/// inference: impute, select, scale. Transforming before fitting fails with
/// [`CoachError::SchemaNotFitted`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preprocessor {
    scaler_kind: ScalerKind,
    imputation: ImputeStrategy,
    selection_k: Option<usize>,
    selection_method: SelectionMethod,
    fitted: Option<FittedState>,
}

impl Preprocessor {
    pub fn new(
        scaler_kind: ScalerKind,
        imputation: ImputeStrategy,
        selection_k: Option<usize>,
        selection_method: SelectionMethod,
    ) -> Self {
        Self {
            scaler_kind,
            imputation,
            selection_k,
            selection_method,
            fitted: None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Names of the columns the fitted pipeline emits, in output order.
    pub fn output_columns(&self) -> Option<Vec<String>> {
        let state = self.fitted.as_ref()?;
        Some(state.selected.iter().map(|&i| state.feature_names[i].clone()).collect())
    }

    /// Normalized selection scores for the surviving columns, descending.
    pub fn selection_weights(&self) -> Option<Vec<(String, f64)>> {
        let state = self.fitted.as_ref()?;
        if state.scores.is_empty() {
            return None;
        }
        let total: f64 = state.selected.iter().map(|&i| state.scores[i].max(0.0)).sum();
        if total <= 0.0 {
            return None;
        }
        let mut out: Vec<(String, f64)> = state
            .selected
            .iter()
            .map(|&i| (state.feature_names[i].clone(), state.scores[i].max(0.0) / total))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1));
        Some(out)
    }

    /// Fit imputation, selection and scaling on training data. Labels are
    /// only needed when supervised selection is configured.
    pub fn fit(&mut self, table: &FeatureTable, labels: Option<&[usize]>) -> Result<()> {
        let feature_names: Vec<String> = table.columns().to_vec();
        let mut data = columnize(table);

        let impute_values: Vec<f64> =
            data.iter().map(|col| impute_value(col, self.imputation)).collect();
        for (col, fill) in data.iter_mut().zip(&impute_values) {
            for v in col.iter_mut() {
                if !v.is_finite() {
                    *v = *fill;
                }
            }
        }

        let (selected, scores) = match (self.selection_k, labels) {
            (Some(k), Some(y)) if k < feature_names.len() => {
                self.select_features(&data, y, k.max(1))?
            }
            _ => ((0..feature_names.len()).collect(), Vec::new()),
        };

        let picked: Vec<&Vec<f64>> = selected.iter().map(|&i| &data[i]).collect();
        let scaler = fit_scaler(self.scaler_kind, &picked);

        self.fitted = Some(FittedState {
            feature_names,
            impute_values,
            selected,
            scores,
            scaler,
        });
        Ok(())
    }

    /// Apply the fitted pipeline. Missing columns are injected as zero with a
    /// warning; columns are reordered to the fitted schema.
    pub fn transform(&self, table: &FeatureTable) -> Result<Matrix> {
        let state = self.fitted.as_ref().ok_or(CoachError::SchemaNotFitted)?;

        let missing: Vec<&String> = state
            .feature_names
            .iter()
            .filter(|name| table.column(name).is_none())
            .collect();
        if !missing.is_empty() {
            log::warn!("transform input missing {} columns: {missing:?}", missing.len());
        }

        let n = table.n_rows();
        let mut data: Vec<Vec<f64>> = Vec::with_capacity(state.feature_names.len());
        for (idx, name) in state.feature_names.iter().enumerate() {
            let mut col = match table.column(name) {
                Some(values) => values.to_vec(),
                None => vec![0.0; n],
            };
            let fill = state.impute_values[idx];
            for v in col.iter_mut() {
                if !v.is_finite() {
                    *v = fill;
                }
            }
            data.push(col);
        }

        let mut rows = vec![Vec::with_capacity(state.selected.len()); n];
        for (out_idx, &col_idx) in state.selected.iter().enumerate() {
            for (row_idx, row) in rows.iter_mut().enumerate() {
                row.push(scale_value(&state.scaler, out_idx, data[col_idx][row_idx]));
            }
        }

        Ok(Matrix {
            columns: state
                .selected
                .iter()
                .map(|&i| state.feature_names[i].clone())
                .collect(),
            rows,
        })
    }

    pub fn fit_transform(&mut self, table: &FeatureTable, labels: Option<&[usize]>) -> Result<Matrix> {
        self.fit(table, labels)?;
        self.transform(table)
    }

    fn select_features(
        &self,
        data: &[Vec<f64>],
        labels: &[usize],
        k: usize,
    ) -> Result<(Vec<usize>, Vec<f64>)> {
        let n_cols = data.len();
        let k = k.min(n_cols);
        match self.selection_method {
            SelectionMethod::MutualInfo => {
                let scores: Vec<f64> =
                    data.iter().map(|col| mutual_information(col, labels)).collect();
                Ok((top_k_indices(&scores, k), scores))
            }
            SelectionMethod::FTest => {
                let scores: Vec<f64> = data.iter().map(|col| f_statistic(col, labels)).collect();
                Ok((top_k_indices(&scores, k), scores))
            }
            SelectionMethod::RecursiveElimination => self.recursive_elimination(data, labels, k),
        }
    }

    /// Drop the least important feature (by forest impurity importance) one
    /// at a time until `k` remain.
    fn recursive_elimination(
        &self,
        data: &[Vec<f64>],
        labels: &[usize],
        k: usize,
    ) -> Result<(Vec<usize>, Vec<f64>)> {
        let n_rows = data.first().map_or(0, |c| c.len());
        let mut remaining: Vec<usize> = (0..data.len()).collect();
        let mut scores = vec![0.0; data.len()];

        // Small, fixed-seed forests keep each elimination round cheap.
        let settings = ForestSettings {
            n_trees: 25,
            max_depth: 6,
            min_samples_split: 2,
            min_samples_leaf: 1,
            seed: 7,
        };

        while remaining.len() > k {
            let rows: Vec<Vec<f64>> = (0..n_rows)
                .map(|r| remaining.iter().map(|&c| data[c][r]).collect())
                .collect();
            let forest = RandomForest::fit(&rows, labels, &settings)?;
            let importances = forest.feature_importances();

            let worst = importances
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            for (local, &col) in remaining.iter().enumerate() {
                scores[col] = importances.get(local).copied().unwrap_or(0.0);
            }
            remaining.remove(worst);
        }
        remaining.sort_unstable();
        Ok((remaining, scores))
    }
}

fn columnize(table: &FeatureTable) -> Vec<Vec<f64>> {
    table
        .columns()
        .iter()
        .map(|name| table.column(name).map(|s| s.to_vec()).unwrap_or_default())
        .collect()
}

fn impute_value(col: &[f64], strategy: ImputeStrategy) -> f64 {
    let finite: Vec<f64> = col.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    match strategy {
        ImputeStrategy::Mean => crate::features::mean(&finite),
        ImputeStrategy::Median => quantile(&finite, 0.5),
        ImputeStrategy::MostFrequent => most_frequent(&finite),
    }
}

fn most_frequent(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut best = sorted[0];
    let mut best_count = 0usize;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        if j - i > best_count {
            best_count = j - i;
            best = sorted[i];
        }
        i = j;
    }
    best
}

/// Linear-interpolated quantile, `q` in [0, 1].
pub(crate) fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

fn fit_scaler(kind: ScalerKind, columns: &[&Vec<f64>]) -> FittedScaler {
    match kind {
        ScalerKind::Standard => {
            let means: Vec<f64> = columns.iter().map(|c| crate::features::mean(c)).collect();
            let stds: Vec<f64> = columns
                .iter()
                .map(|c| population_std(c).max(1e-9))
                .collect();
            FittedScaler::Standard { means, stds }
        }
        ScalerKind::MinMax => {
            let mins: Vec<f64> = columns
                .iter()
                .map(|c| c.iter().copied().fold(f64::INFINITY, f64::min))
                .map(|v| if v.is_finite() { v } else { 0.0 })
                .collect();
            let spans: Vec<f64> = columns
                .iter()
                .zip(&mins)
                .map(|(c, lo)| {
                    let hi = c.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    if hi.is_finite() { (hi - lo).max(1e-9) } else { 1.0 }
                })
                .collect();
            FittedScaler::MinMax { mins, spans }
        }
        ScalerKind::Robust => {
            let medians: Vec<f64> = columns.iter().map(|c| quantile(c, 0.5)).collect();
            let iqrs: Vec<f64> = columns
                .iter()
                .map(|c| (quantile(c, 0.75) - quantile(c, 0.25)).max(1e-9))
                .collect();
            FittedScaler::Robust { medians, iqrs }
        }
    }
}

fn scale_value(scaler: &FittedScaler, col: usize, value: f64) -> f64 {
    match scaler {
        FittedScaler::Standard { means, stds } => (value - means[col]) / stds[col],
        FittedScaler::MinMax { mins, spans } => (value - mins[col]) / spans[col],
        FittedScaler::Robust { medians, iqrs } => (value - medians[col]) / iqrs[col],
    }
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = crate::features::mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Binned mutual information between a continuous feature and discrete labels.
fn mutual_information(col: &[f64], labels: &[usize]) -> f64 {
    let n = col.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    let bins = bin_assignments(&col[..n], 8);
    let n_bins = bins.iter().copied().max().map_or(0, |b| b + 1);
    let n_classes = labels[..n].iter().copied().max().map_or(0, |c| c + 1);
    if n_bins == 0 || n_classes == 0 {
        return 0.0;
    }

    let mut joint = vec![vec![0.0_f64; n_classes]; n_bins];
    let mut p_bin = vec![0.0_f64; n_bins];
    let mut p_class = vec![0.0_f64; n_classes];
    for i in 0..n {
        joint[bins[i]][labels[i]] += 1.0;
        p_bin[bins[i]] += 1.0;
        p_class[labels[i]] += 1.0;
    }

    let total = n as f64;
    let mut mi = 0.0;
    for (b, row) in joint.iter().enumerate() {
        for (c, &count) in row.iter().enumerate() {
            if count > 0.0 {
                let p_xy = count / total;
                let p_x = p_bin[b] / total;
                let p_y = p_class[c] / total;
                mi += p_xy * (p_xy / (p_x * p_y)).ln();
            }
        }
    }
    mi.max(0.0)
}

/// Quantile-bin assignment for each value; constant columns land in bin 0.
fn bin_assignments(col: &[f64], max_bins: usize) -> Vec<usize> {
    let mut edges: Vec<f64> = (1..max_bins)
        .map(|b| quantile(col, b as f64 / max_bins as f64))
        .collect();
    edges.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
    col.iter()
        .map(|&v| edges.iter().take_while(|&&e| v > e).count())
        .collect()
}

/// One-way ANOVA F statistic of a feature grouped by class label.
fn f_statistic(col: &[f64], labels: &[usize]) -> f64 {
    let n = col.len().min(labels.len());
    if n < 2 {
        return 0.0;
    }
    let n_classes = labels[..n].iter().copied().max().map_or(0, |c| c + 1);
    if n_classes < 2 {
        return 0.0;
    }

    let grand = crate::features::mean(&col[..n]);
    let mut sums = vec![0.0_f64; n_classes];
    let mut counts = vec![0usize; n_classes];
    for i in 0..n {
        sums[labels[i]] += col[i];
        counts[labels[i]] += 1;
    }

    let mut between = 0.0;
    let mut within = 0.0;
    for c in 0..n_classes {
        if counts[c] == 0 {
            continue;
        }
        let group_mean = sums[c] / counts[c] as f64;
        between += counts[c] as f64 * (group_mean - grand).powi(2);
    }
    for i in 0..n {
        let group_mean = sums[labels[i]] / counts[labels[i]] as f64;
        within += (col[i] - group_mean).powi(2);
    }

    let groups = counts.iter().filter(|&&c| c > 0).count();
    if groups < 2 || n <= groups {
        return 0.0;
    }
    let msb = between / (groups - 1) as f64;
    let msw = within / (n - groups) as f64;
    if msw <= 1e-12 {
        if msb > 0.0 { 1e12 } else { 0.0 }
    } else {
        msb / msw
    }
}

/// Indices of the `k` highest scores, returned in ascending column order so
/// the output schema preserves training column order.
fn top_k_indices(scores: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    let mut picked: Vec<usize> = order.into_iter().take(k).collect();
    picked.sort_unstable();
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::extract_history;
    use crate::{MatchRecord, MatchResult};
    use chrono::{TimeZone, Utc};

    fn table(n: usize) -> FeatureTable {
        let matches: Vec<MatchRecord> = (0..n)
            .map(|i| MatchRecord {
                id: format!("m{i}").as_str().into(),
                user_id: "u1".into(),
                playlist: "Ranked Doubles".to_string(),
                duration_seconds: 300 + 10 * i as u32,
                match_date: Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::days(i as i64),
                score_team_0: 3,
                score_team_1: 2,
                result: if i % 2 == 0 { MatchResult::Win } else { MatchResult::Loss },
                goals: (i % 4) as u32,
                assists: 1,
                saves: (i % 3) as u32,
                shots: 4,
                score: 200 + 50 * (i as u32 % 5),
                boost_usage: Some(0.4 + 0.05 * (i % 5) as f64),
                average_speed: Some(900.0 + 20.0 * i as f64),
                time_on_ground: Some(0.6),
                time_low_air: Some(0.3),
                time_high_air: Some(20.0),
                processed: true,
            })
            .collect();
        extract_history(&matches, 10).unwrap()
    }

    fn labels(n: usize) -> Vec<usize> {
        (0..n).map(|i| i % 3).collect()
    }

    #[test]
    fn transform_before_fit_fails() {
        let pre = Preprocessor::new(
            ScalerKind::Standard,
            ImputeStrategy::Median,
            None,
            SelectionMethod::MutualInfo,
        );
        let err = pre.transform(&table(4)).unwrap_err();
        assert!(matches!(err, CoachError::SchemaNotFitted));
    }

    #[test]
    fn transform_is_deterministic_for_identical_input() {
        let t = table(12);
        let mut pre = Preprocessor::new(
            ScalerKind::Standard,
            ImputeStrategy::Median,
            Some(15),
            SelectionMethod::MutualInfo,
        );
        pre.fit(&t, Some(&labels(12))).unwrap();
        let a = pre.transform(&t).unwrap();
        let b = pre.transform(&t).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.n_columns(), 15);
        assert_eq!(a.n_rows(), 12);
    }

    #[test]
    fn selection_preserves_training_column_order() {
        let t = table(12);
        let mut pre = Preprocessor::new(
            ScalerKind::MinMax,
            ImputeStrategy::Mean,
            Some(10),
            SelectionMethod::FTest,
        );
        pre.fit(&t, Some(&labels(12))).unwrap();
        let out = pre.output_columns().unwrap();
        let positions: Vec<usize> = out
            .iter()
            .map(|name| t.columns().iter().position(|c| c == name).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn missing_columns_injected_as_zero() {
        let big = table(10);
        let mut pre = Preprocessor::new(
            ScalerKind::Standard,
            ImputeStrategy::Median,
            None,
            SelectionMethod::MutualInfo,
        );
        pre.fit(&big, None).unwrap();

        // A smaller history lacks the 10-window rolling columns.
        let small = table(3);
        let out = pre.transform(&small).unwrap();
        assert_eq!(out.n_columns(), big.n_columns());
        assert_eq!(out.n_rows(), 3);
        assert!(out.rows.iter().all(|r| r.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn zero_variance_column_scales_finite() {
        let t = table(8);
        let mut pre = Preprocessor::new(
            ScalerKind::Standard,
            ImputeStrategy::Median,
            None,
            SelectionMethod::MutualInfo,
        );
        // `assists` is constant 1 in the fixture.
        pre.fit(&t, None).unwrap();
        let out = pre.transform(&t).unwrap();
        let idx = out.columns.iter().position(|c| c == "assists").unwrap();
        assert!(out.rows.iter().all(|r| r[idx].abs() < 1e-6));
    }

    #[test]
    fn robust_scaler_centers_on_median() {
        let t = table(9);
        let mut pre = Preprocessor::new(
            ScalerKind::Robust,
            ImputeStrategy::Median,
            None,
            SelectionMethod::MutualInfo,
        );
        pre.fit(&t, None).unwrap();
        let out = pre.transform(&t).unwrap();
        let idx = out.columns.iter().position(|c| c == "score").unwrap();
        let mut col: Vec<f64> = out.rows.iter().map(|r| r[idx]).collect();
        col.sort_by(f64::total_cmp);
        let med = col[col.len() / 2];
        assert!(med.abs() < 1e-9);
    }

    #[test]
    fn recursive_elimination_keeps_k_features() {
        let t = table(14);
        let mut pre = Preprocessor::new(
            ScalerKind::Standard,
            ImputeStrategy::Median,
            Some(8),
            SelectionMethod::RecursiveElimination,
        );
        pre.fit(&t, Some(&labels(14))).unwrap();
        assert_eq!(pre.output_columns().unwrap().len(), 8);
    }

    #[test]
    fn quantile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&values, 0.5) - 2.5).abs() < 1e-12);
        assert_eq!(quantile(&values, 0.0), 1.0);
        assert_eq!(quantile(&values, 1.0), 4.0);
    }

    #[test]
    fn mutual_information_favors_informative_feature() {
        let labels: Vec<usize> = (0..30).map(|i| i % 2).collect();
        let informative: Vec<f64> = labels.iter().map(|&l| l as f64 * 10.0).collect();
        let noise: Vec<f64> = (0..30).map(|i| (i % 7) as f64).collect();
        assert!(mutual_information(&informative, &labels) > mutual_information(&noise, &labels));
    }
}
