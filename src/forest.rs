use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{CoachError, Result};

/// Tuning knobs for the ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestSettings {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestSettings {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        /// Class-weighted probability distribution, sums to 1.
        dist: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn leaf_dist(&self, row: &[f64]) -> &[f64] {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { dist } => return dist,
                Node::Split { feature, threshold, left, right } => {
                    idx = if row.get(*feature).copied().unwrap_or(0.0) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

/// Bagged ensemble of gini decision trees with inverse-frequency class
/// weights. Per-class probabilities are the normalized average of the leaf
/// distributions across trees, so every row sums to 1.
///
/// Training is deterministic for a fixed seed: each tree derives its own RNG
/// from `seed + tree index`, independent of scheduling order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<Tree>,
    n_classes: usize,
    n_features: usize,
    class_weights: Vec<f64>,
    importances: Vec<f64>,
}

impl RandomForest {
    pub fn fit(rows: &[Vec<f64>], labels: &[usize], settings: &ForestSettings) -> Result<Self> {
        if rows.is_empty() || rows.len() != labels.len() {
            return Err(CoachError::internal(
                "forest fit",
                format!("{} rows vs {} labels", rows.len(), labels.len()),
            ));
        }
        let n_features = rows[0].len();
        if n_features == 0 {
            return Err(CoachError::internal("forest fit", "no feature columns"));
        }

        let n_classes = labels.iter().copied().max().unwrap_or(0) + 1;
        let mut counts = vec![0usize; n_classes];
        for &y in labels {
            counts[y] += 1;
        }
        let present = counts.iter().filter(|&&c| c > 0).count().max(1);
        let class_weights: Vec<f64> = counts
            .iter()
            .map(|&c| if c > 0 { labels.len() as f64 / (present as f64 * c as f64) } else { 0.0 })
            .collect();

        let n_sub = (n_features as f64).sqrt().ceil() as usize;
        let built: Vec<(Tree, Vec<f64>)> = (0..settings.n_trees.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(t as u64));
                grow_tree(
                    rows,
                    labels,
                    &class_weights,
                    n_classes,
                    n_sub.max(1),
                    settings,
                    &mut rng,
                )
            })
            .collect();

        let mut importances = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(built.len());
        for (tree, imp) in built {
            for (slot, v) in importances.iter_mut().zip(imp) {
                *slot += v;
            }
            trees.push(tree);
        }
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            for v in importances.iter_mut() {
                *v /= total;
            }
        }

        Ok(Self {
            trees,
            n_classes,
            n_features,
            class_weights,
            importances,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Inverse-frequency weights the ensemble was balanced with.
    pub fn class_weights(&self) -> &[f64] {
        &self.class_weights
    }

    /// Normalized impurity-decrease importance per feature, sums to 1.
    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }

    /// Per-class probabilities for each row; each output row sums to 1.
    pub fn predict_proba(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter()
            .map(|row| {
                let mut acc = vec![0.0; self.n_classes];
                for tree in &self.trees {
                    for (slot, p) in acc.iter_mut().zip(tree.leaf_dist(row)) {
                        *slot += p;
                    }
                }
                let sum: f64 = acc.iter().sum();
                if sum > 0.0 {
                    for p in acc.iter_mut() {
                        *p /= sum;
                    }
                }
                acc
            })
            .collect()
    }

    /// Arg-max class per row.
    pub fn predict(&self, rows: &[Vec<f64>]) -> Vec<usize> {
        self.predict_proba(rows)
            .into_iter()
            .map(|p| {
                p.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Fraction of rows predicted correctly.
    pub fn accuracy(&self, rows: &[Vec<f64>], labels: &[usize]) -> f64 {
        if rows.is_empty() {
            return 0.0;
        }
        let hits = self
            .predict(rows)
            .iter()
            .zip(labels)
            .filter(|(p, y)| p == y)
            .count();
        hits as f64 / rows.len() as f64
    }
}

fn grow_tree(
    rows: &[Vec<f64>],
    labels: &[usize],
    class_weights: &[f64],
    n_classes: usize,
    n_sub: usize,
    settings: &ForestSettings,
    rng: &mut StdRng,
) -> (Tree, Vec<f64>) {
    // Bootstrap sample with replacement.
    let n = rows.len();
    let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();

    let mut tree = Tree { nodes: Vec::new() };
    let mut importances = vec![0.0; rows[0].len()];
    build_node(
        rows,
        labels,
        class_weights,
        n_classes,
        n_sub,
        settings,
        rng,
        &sample,
        0,
        &mut tree,
        &mut importances,
    );
    (tree, importances)
}

#[allow(clippy::too_many_arguments)]
fn build_node(
    rows: &[Vec<f64>],
    labels: &[usize],
    class_weights: &[f64],
    n_classes: usize,
    n_sub: usize,
    settings: &ForestSettings,
    rng: &mut StdRng,
    indices: &[usize],
    depth: usize,
    tree: &mut Tree,
    importances: &mut Vec<f64>,
) -> usize {
    let weighted = weighted_counts(labels, class_weights, n_classes, indices);
    let node_impurity = gini(&weighted);
    let node_weight: f64 = weighted.iter().sum();

    let is_pure = weighted.iter().filter(|&&w| w > 0.0).count() <= 1;
    if depth >= settings.max_depth || indices.len() < settings.min_samples_split || is_pure {
        return push_leaf(tree, weighted);
    }

    let n_features = rows[0].len();
    let mut candidates: Vec<usize> = (0..n_features).collect();
    // Fisher-Yates prefix shuffle picks the feature subset.
    for i in 0..n_sub.min(n_features) {
        let j = rng.gen_range(i..n_features);
        candidates.swap(i, j);
    }
    candidates.truncate(n_sub.min(n_features));

    let mut best: Option<(usize, f64, f64)> = None; // (feature, threshold, decrease)
    for &feature in &candidates {
        let mut values: Vec<f64> = indices.iter().map(|&i| rows[i][feature]).collect();
        values.sort_by(f64::total_cmp);
        values.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        if values.len() < 2 {
            continue;
        }
        // Bound threshold candidates on wide columns.
        let step = (values.len() / 32).max(1);
        for pair in values.windows(2).step_by(step) {
            let threshold = (pair[0] + pair[1]) / 2.0;
            let (left, right): (Vec<usize>, Vec<usize>) =
                indices.iter().copied().partition(|&i| rows[i][feature] <= threshold);
            if left.len() < settings.min_samples_leaf || right.len() < settings.min_samples_leaf {
                continue;
            }
            let wl = weighted_counts(labels, class_weights, n_classes, &left);
            let wr = weighted_counts(labels, class_weights, n_classes, &right);
            let lw: f64 = wl.iter().sum();
            let rw: f64 = wr.iter().sum();
            if node_weight <= 0.0 {
                continue;
            }
            let child_impurity = (lw * gini(&wl) + rw * gini(&wr)) / node_weight;
            let decrease = node_impurity - child_impurity;
            if decrease > best.map_or(1e-12, |b| b.2) {
                best = Some((feature, threshold, decrease));
            }
        }
    }

    let Some((feature, threshold, decrease)) = best else {
        return push_leaf(tree, weighted);
    };
    importances[feature] += node_weight * decrease;

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
        indices.iter().copied().partition(|&i| rows[i][feature] <= threshold);

    // Reserve the split slot before recursing so child indices are stable.
    let slot = tree.nodes.len();
    tree.nodes.push(Node::Leaf { dist: Vec::new() });
    let left = build_node(
        rows, labels, class_weights, n_classes, n_sub, settings, rng, &left_idx, depth + 1, tree,
        importances,
    );
    let right = build_node(
        rows, labels, class_weights, n_classes, n_sub, settings, rng, &right_idx, depth + 1, tree,
        importances,
    );
    tree.nodes[slot] = Node::Split { feature, threshold, left, right };
    slot
}

fn push_leaf(tree: &mut Tree, weighted: Vec<f64>) -> usize {
    let sum: f64 = weighted.iter().sum();
    let dist = if sum > 0.0 {
        weighted.iter().map(|w| w / sum).collect()
    } else {
        let n = weighted.len().max(1);
        vec![1.0 / n as f64; n]
    };
    tree.nodes.push(Node::Leaf { dist });
    tree.nodes.len() - 1
}

fn weighted_counts(
    labels: &[usize],
    class_weights: &[f64],
    n_classes: usize,
    indices: &[usize],
) -> Vec<f64> {
    let mut counts = vec![0.0; n_classes];
    for &i in indices {
        counts[labels[i]] += class_weights[labels[i]];
    }
    counts
}

fn gini(weighted: &[f64]) -> f64 {
    let total: f64 = weighted.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - weighted.iter().map(|w| (w / total).powi(2)).sum::<f64>()
}
