//! Random Forest Regressor
//!
//! Bagged CART regression trees used as the base learner of the uplift
//! meta-learner. Splits minimize the summed squared error of the two
//! children; thresholds sit halfway between adjacent distinct values.
//!
//! Trees are grown in parallel. Each tree draws its own seed from a master
//! generator up front, so the fitted forest does not depend on thread
//! scheduling.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::domain::{AnalysisError, FeatureMatrix};
use crate::estimators::params::ForestConfig;
use crate::ports::{FittedRegressor, Regressor};

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// One fitted regression tree; node 0 is the root
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes[idx] {
                Node::Leaf(value) => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[feature] <= threshold { left } else { right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match nodes[idx] {
                Node::Leaf(_) => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, left).max(walk(nodes, right)),
            }
        }
        walk(&self.nodes, 0)
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf(_))).count()
    }
}

struct TreeBuilder<'a> {
    x: &'a FeatureMatrix,
    y: &'a [f64],
    config: &'a ForestConfig,
    nodes: Vec<Node>,
}

struct SplitChoice {
    feature: usize,
    threshold: f64,
    sse: f64,
}

impl<'a> TreeBuilder<'a> {
    fn build(mut self, rows: Vec<usize>, rng: &mut StdRng) -> RegressionTree {
        self.grow(rows, 0, rng);
        RegressionTree { nodes: self.nodes }
    }

    fn grow(&mut self, rows: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let idx = self.nodes.len();
        let value = rows.iter().map(|&i| self.y[i]).sum::<f64>() / rows.len() as f64;
        self.nodes.push(Node::Leaf(value));

        if depth >= self.config.max_depth || rows.len() < 2 * self.config.min_samples_leaf {
            return idx;
        }
        let Some(split) = self.best_split(&rows, rng) else {
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&i| self.x.get(i, split.feature) <= split.threshold);
        let left = self.grow(left_rows, depth + 1, rng);
        let right = self.grow(right_rows, depth + 1, rng);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    fn best_split(&self, rows: &[usize], rng: &mut StdRng) -> Option<SplitChoice> {
        let n_features = self.x.n_cols();
        let features: Vec<usize> = match self.config.max_features {
            Some(m) if m < n_features => {
                let mut picked = sample(rng, n_features, m).into_vec();
                picked.sort_unstable();
                picked
            }
            _ => (0..n_features).collect(),
        };

        let n = rows.len();
        let total: f64 = rows.iter().map(|&i| self.y[i]).sum();
        let total_sq: f64 = rows.iter().map(|&i| self.y[i] * self.y[i]).sum();
        let parent_sse = total_sq - total * total / n as f64;
        let min_leaf = self.config.min_samples_leaf;

        let mut best: Option<SplitChoice> = None;
        for &feature in &features {
            let mut sorted: Vec<(f64, f64)> = rows
                .iter()
                .map(|&i| (self.x.get(i, feature), self.y[i]))
                .collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let (mut left_sum, mut left_sq) = (0.0, 0.0);
            for k in 0..n - 1 {
                let (xv, yv) = sorted[k];
                left_sum += yv;
                left_sq += yv * yv;
                let n_left = k + 1;
                let n_right = n - n_left;
                if n_left < min_leaf || n_right < min_leaf || xv == sorted[k + 1].0 {
                    continue;
                }
                let right_sum = total - left_sum;
                let right_sq = total_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / n_left as f64)
                    + (right_sq - right_sum * right_sum / n_right as f64);
                if best.as_ref().map_or(true, |b| sse < b.sse) {
                    best = Some(SplitChoice {
                        feature,
                        threshold: 0.5 * (xv + sorted[k + 1].0),
                        sse,
                    });
                }
            }
        }
        best.filter(|b| b.sse < parent_sse - 1e-12)
    }
}

/// Untrained random forest
#[derive(Debug, Clone, Default)]
pub struct RandomForestRegressor {
    config: ForestConfig,
}

impl RandomForestRegressor {
    pub fn new(config: ForestConfig) -> Self {
        Self { config }
    }
}

/// Fitted forest; predictions average the trees
#[derive(Debug, Clone)]
pub struct FittedForest {
    trees: Vec<RegressionTree>,
}

impl FittedForest {
    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }
}

impl FittedRegressor for FittedForest {
    fn predict_row(&self, row: &[f64]) -> f64 {
        self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / self.trees.len() as f64
    }
}

impl Regressor for RandomForestRegressor {
    type Fitted = FittedForest;

    fn fit(&self, x: &FeatureMatrix, y: &[f64], seed: u64) -> Result<FittedForest, AnalysisError> {
        self.config.validate()?;
        if x.n_rows() != y.len() {
            return Err(AnalysisError::DataValidation(format!(
                "forest: {} feature rows but {} targets",
                x.n_rows(),
                y.len()
            )));
        }
        if x.is_empty() {
            return Err(AnalysisError::DataValidation(
                "forest: cannot fit on zero rows".to_string(),
            ));
        }
        if y.iter().any(|v| !v.is_finite()) || x.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::DataValidation(
                "forest: inputs must be finite".to_string(),
            ));
        }

        let n = x.n_rows();
        let mut master = StdRng::seed_from_u64(seed);
        let tree_seeds: Vec<u64> = (0..self.config.n_trees).map(|_| master.gen()).collect();

        let trees = tree_seeds
            .into_par_iter()
            .map(|tree_seed| {
                let mut rng = StdRng::seed_from_u64(tree_seed);
                let rows: Vec<usize> = if self.config.bootstrap {
                    (0..n).map(|_| rng.gen_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                TreeBuilder {
                    x,
                    y,
                    config: &self.config,
                    nodes: Vec::new(),
                }
                .build(rows, &mut rng)
            })
            .collect::<Vec<_>>();

        tracing::debug!("Forest: fitted {} trees on {} rows", trees.len(), n);
        Ok(FittedForest { trees })
    }
}
