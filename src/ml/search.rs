use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::model::{
    format_params, mean_absolute_error, mean_squared_error, r2_score, root_mean_squared_error,
    Estimator, ModelMetrics, ParamSet, ParamValue, Regressor,
};
use crate::error::{PipelineError, PipelineResult};

/// Validation error used to rank parameter combinations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    #[default]
    NegMeanSquaredError,
    NegRootMeanSquaredError,
    NegMeanAbsoluteError,
    R2,
}

impl Scoring {
    /// Lower is better for every variant
    pub fn loss(&self, actual: &[f64], predicted: &[f64]) -> f64 {
        match self {
            Scoring::NegMeanSquaredError => mean_squared_error(actual, predicted),
            Scoring::NegRootMeanSquaredError => root_mean_squared_error(actual, predicted),
            Scoring::NegMeanAbsoluteError => mean_absolute_error(actual, predicted),
            Scoring::R2 => -r2_score(actual, predicted),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Scoring::NegMeanSquaredError => "neg_mean_squared_error",
            Scoring::NegRootMeanSquaredError => "neg_root_mean_squared_error",
            Scoring::NegMeanAbsoluteError => "neg_mean_absolute_error",
            Scoring::R2 => "r2",
        }
    }
}

/// Candidate values per parameter name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamGrid(BTreeMap<String, Vec<ParamValue>>);

impl ParamGrid {
    pub fn with(mut self, name: &str, values: Vec<ParamValue>) -> Self {
        self.0.insert(name.to_string(), values);
        self
    }

    /// The random forest grid used when none is configured
    pub fn forest_default() -> Self {
        let ints = |vals: &[i64]| vals.iter().map(|v| ParamValue::Int(*v)).collect();
        Self::default()
            .with("n_estimators", ints(&[50, 100, 200]))
            .with("max_depth", ints(&[5, 7, 9]))
            .with("min_samples_split", ints(&[2, 5, 10]))
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<ParamValue>)> {
        self.0.iter()
    }

    /// Cartesian product over names in sorted order, last name varying fastest
    pub fn combinations(&self) -> Vec<ParamSet> {
        let mut combos = vec![ParamSet::new()];
        for (name, values) in &self.0 {
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(name.clone(), *value);
                    next.push(extended);
                }
            }
            combos = next;
        }
        combos
    }
}

/// Seeded shuffle followed by a fixed-fraction holdout
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitPolicy {
    pub holdout_fraction: f64,
    pub seed: u64,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.2,
            seed: 42,
        }
    }
}

impl SplitPolicy {
    pub fn validation_size(&self, n: usize) -> usize {
        ((n as f64 * self.holdout_fraction).ceil() as usize).max(1)
    }

    /// `(train, validation)` row indices; identical for identical `n`
    pub fn split(&self, n: usize) -> (Vec<usize>, Vec<usize>) {
        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        indices.shuffle(&mut rng);
        let n_val = self.validation_size(n).min(n);
        let train = indices.split_off(n_val);
        (train, indices)
    }
}

/// Held-out rows shared by the candidate and the champion at promotion time
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationSet {
    pub x: Array2<f64>,
    pub y: Vec<f64>,
}

impl ValidationSet {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn rmse<R: Regressor + ?Sized>(&self, model: &R) -> PipelineResult<f64> {
        let predicted = model.predict(&self.x)?;
        Ok(root_mean_squared_error(&self.y, &predicted))
    }
}

/// Mean CV loss for one grid point, `None` if any fold failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub params: ParamSet,
    pub mean_score: Option<f64>,
}

pub struct SearchOutcome<M> {
    pub best_model: M,
    pub best_params: ParamSet,
    pub cv_score: f64,
    pub metrics: ModelMetrics,
    pub validation: ValidationSet,
    pub train_predictions: (Vec<f64>, Vec<f64>),
    pub val_predictions: (Vec<f64>, Vec<f64>),
    pub scores: Vec<CandidateScore>,
}

/// Exhaustive grid search with k-fold cross-validation on the training partition
#[derive(Debug, Clone)]
pub struct HyperparameterSearch {
    pub grid: ParamGrid,
    pub cv_folds: usize,
    pub scoring: Scoring,
    pub split: SplitPolicy,
    pub max_threads: Option<usize>,
}

impl HyperparameterSearch {
    pub fn new(grid: ParamGrid, cv_folds: usize, scoring: Scoring) -> Self {
        Self {
            grid,
            cv_folds,
            scoring,
            split: SplitPolicy::default(),
            max_threads: None,
        }
    }

    pub fn with_split(mut self, split: SplitPolicy) -> Self {
        self.split = split;
        self
    }

    pub fn with_max_threads(mut self, max_threads: Option<usize>) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn search<E: Estimator>(
        &self,
        estimator: &E,
        x: &Array2<f64>,
        y: &[f64],
    ) -> PipelineResult<SearchOutcome<E::Model>> {
        let n = x.nrows();
        if n != y.len() {
            return Err(PipelineError::DataInsufficient {
                required: n,
                available: y.len(),
                reason: "feature rows and labels differ in length".to_string(),
            });
        }
        if self.cv_folds < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "cv_folds must be >= 2, got {}",
                self.cv_folds
            )));
        }
        if n < self.cv_folds {
            return Err(PipelineError::DataInsufficient {
                required: self.cv_folds,
                available: n,
                reason: "fewer rows than cv folds".to_string(),
            });
        }

        let combinations = self.grid.combinations();
        if combinations.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "parameter grid has a name with no values".to_string(),
            ));
        }

        let (train_idx, val_idx) = self.split.split(n);
        if train_idx.len() < self.cv_folds {
            return Err(PipelineError::DataInsufficient {
                required: self.cv_folds,
                available: train_idx.len(),
                reason: "training partition smaller than cv folds".to_string(),
            });
        }

        let x_train = x.select(Axis(0), &train_idx);
        let y_train: Vec<f64> = train_idx.iter().map(|&i| y[i]).collect();
        let x_val = x.select(Axis(0), &val_idx);
        let y_val: Vec<f64> = val_idx.iter().map(|&i| y[i]).collect();

        info!(
            "Grid search: {} combinations x {} folds on {} training rows ({} held out, scoring={})",
            combinations.len(),
            self.cv_folds,
            train_idx.len(),
            val_idx.len(),
            self.scoring.as_str()
        );

        let scores = self.cross_validate(estimator, &combinations, &x_train, &y_train)?;

        let (best_index, cv_score) = select_best(&scores).ok_or_else(|| {
            PipelineError::Training(format!(
                "all {} parameter combinations failed",
                combinations.len()
            ))
        })?;
        let best_params = combinations[best_index].clone();
        info!(
            "Best parameters: {} (cv {}={:.6})",
            format_params(&best_params),
            self.scoring.as_str(),
            cv_score
        );

        let best_model = estimator.fit(&x_train, &y_train, &best_params)?;
        let train_pred = best_model.predict(&x_train)?;
        let val_pred = best_model.predict(&x_val)?;

        let metrics = ModelMetrics {
            rmse_train: root_mean_squared_error(&y_train, &train_pred),
            rmse_val: root_mean_squared_error(&y_val, &val_pred),
            r2_train: r2_score(&y_train, &train_pred),
            r2_val: r2_score(&y_val, &val_pred),
            train_samples: y_train.len(),
            val_samples: y_val.len(),
        };
        info!(
            "Refit on full training partition: rmse_train={:.4} rmse_val={:.4} r2_train={:.4} r2_val={:.4}",
            metrics.rmse_train, metrics.rmse_val, metrics.r2_train, metrics.r2_val
        );

        Ok(SearchOutcome {
            best_model,
            best_params,
            cv_score,
            metrics,
            validation: ValidationSet {
                x: x_val,
                y: y_val.clone(),
            },
            train_predictions: (y_train, train_pred),
            val_predictions: (y_val, val_pred),
            scores,
        })
    }

    /// Evaluates every (combination, fold) pair on the rayon pool
    fn cross_validate<E: Estimator>(
        &self,
        estimator: &E,
        combinations: &[ParamSet],
        x_train: &Array2<f64>,
        y_train: &[f64],
    ) -> PipelineResult<Vec<CandidateScore>> {
        let folds = kfold_indices(y_train.len(), self.cv_folds);
        let tasks: Vec<(usize, usize)> = (0..combinations.len())
            .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
            .collect();

        let evaluate = || -> Vec<(usize, PipelineResult<f64>)> {
            tasks
                .par_iter()
                .map(|&(c, f)| {
                    let (fit_idx, score_idx) = &folds[f];
                    let x_fit = x_train.select(Axis(0), fit_idx);
                    let y_fit: Vec<f64> = fit_idx.iter().map(|&i| y_train[i]).collect();
                    let x_score = x_train.select(Axis(0), score_idx);
                    let y_score: Vec<f64> = score_idx.iter().map(|&i| y_train[i]).collect();

                    let result = estimator
                        .fit(&x_fit, &y_fit, &combinations[c])
                        .and_then(|model| model.predict(&x_score))
                        .map(|pred| self.scoring.loss(&y_score, &pred));
                    (c, result)
                })
                .collect()
        };

        let results = match self.max_threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| PipelineError::Training(format!("thread pool: {}", e)))?
                .install(evaluate),
            None => evaluate(),
        };

        let mut fold_losses: Vec<Vec<f64>> = vec![Vec::with_capacity(folds.len()); combinations.len()];
        let mut failed = vec![false; combinations.len()];
        for (c, result) in results {
            match result {
                Ok(loss) => fold_losses[c].push(loss),
                Err(e) => {
                    if !failed[c] {
                        warn!("Discarding {}: {}", format_params(&combinations[c]), e);
                    }
                    failed[c] = true;
                }
            }
        }

        Ok(combinations
            .iter()
            .enumerate()
            .map(|(c, params)| {
                let mean_score = if failed[c] {
                    None
                } else {
                    Some(fold_losses[c].iter().sum::<f64>() / fold_losses[c].len() as f64)
                };
                debug!("  {} -> {:?}", format_params(params), mean_score);
                CandidateScore {
                    params: params.clone(),
                    mean_score,
                }
            })
            .collect())
    }
}

/// Lowest finite mean score; ties go to the earliest grid position
fn select_best(scores: &[CandidateScore]) -> Option<(usize, f64)> {
    scores
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.mean_score.filter(|v| !v.is_nan()).map(|v| (i, v)))
        .fold(None, |best, (i, v)| match best {
            Some((_, best_v)) if v >= best_v => best,
            _ => Some((i, v)),
        })
}

/// Contiguous, unshuffled folds; the first `n % k` folds take one extra row
pub fn kfold_indices(n: usize, k: usize) -> Vec<(Vec<usize>, Vec<usize>)> {
    let base = n / k;
    let extra = n % k;
    let mut start = 0;
    (0..k)
        .map(|fold| {
            let size = base + usize::from(fold < extra);
            let end = start + size;
            let test: Vec<usize> = (start..end).collect();
            let train: Vec<usize> = (0..start).chain(end..n).collect();
            start = end;
            (train, test)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::testing::ScaledEstimator;
    use crate::ml::model::ForestEstimator;

    fn linear_data(n: usize) -> (Array2<f64>, Vec<f64>) {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 + 1.0 } else { 0.0 });
        let y = (0..n).map(|i| 2.0 * (i as f64 + 1.0)).collect();
        (x, y)
    }

    fn floats(values: &[f64]) -> Vec<ParamValue> {
        values.iter().map(|v| ParamValue::Float(*v)).collect()
    }

    #[test]
    fn test_grid_combination_order() {
        let grid = ParamGrid::default()
            .with("b", vec![ParamValue::Int(1), ParamValue::Int(2)])
            .with("a", vec![ParamValue::Int(10), ParamValue::Int(20)]);
        let combos = grid.combinations();
        let rendered: Vec<String> = combos.iter().map(format_params).collect();
        assert_eq!(
            rendered,
            vec!["a=10, b=1", "a=10, b=2", "a=20, b=1", "a=20, b=2"]
        );
        assert_eq!(ParamGrid::forest_default().combinations().len(), 27);
        assert_eq!(ParamGrid::default().combinations().len(), 1);
        assert!(ParamGrid::default().with("a", vec![]).combinations().is_empty());
    }

    #[test]
    fn test_kfold_indices() {
        let folds = kfold_indices(10, 3);
        let sizes: Vec<usize> = folds.iter().map(|(_, test)| test.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(folds[1].1, vec![4, 5, 6]);
        assert_eq!(folds[1].0, vec![0, 1, 2, 3, 7, 8, 9]);
    }

    #[test]
    fn test_split_is_reproducible() {
        let policy = SplitPolicy::default();
        let (train_a, val_a) = policy.split(50);
        let (train_b, val_b) = policy.split(50);
        assert_eq!(train_a, train_b);
        assert_eq!(val_a, val_b);
        assert_eq!(val_a.len(), 10);

        let mut all: Vec<usize> = train_a.iter().chain(val_a.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());

        assert_eq!(policy.validation_size(11), 3);
    }

    #[test]
    fn test_search_picks_best_scale() {
        let (x, y) = linear_data(30);
        let search = HyperparameterSearch::new(
            ParamGrid::default().with("scale", floats(&[1.0, 2.0, 3.0])),
            3,
            Scoring::NegMeanSquaredError,
        );
        let outcome = search.search(&ScaledEstimator, &x, &y).unwrap();

        assert_eq!(outcome.best_params["scale"], ParamValue::Float(2.0));
        assert_eq!(outcome.cv_score, 0.0);
        assert_eq!(outcome.metrics.rmse_val, 0.0);
        assert_eq!(outcome.metrics.r2_val, 1.0);
        assert_eq!(outcome.metrics.val_samples, 6);
        assert_eq!(outcome.metrics.train_samples, 24);
        assert_eq!(outcome.validation.len(), 6);
        assert_eq!(outcome.scores.len(), 3);
    }

    #[test]
    fn test_ties_resolve_to_first_in_grid_order() {
        let (x, y) = linear_data(20);
        let grid = ParamGrid::default()
            .with("scale", floats(&[2.0]))
            .with("tag", vec![ParamValue::Int(1), ParamValue::Int(0)]);
        let search = HyperparameterSearch::new(grid, 2, Scoring::NegRootMeanSquaredError);

        for threads in [None, Some(1), Some(4)] {
            let outcome = search
                .clone()
                .with_max_threads(threads)
                .search(&ScaledEstimator, &x, &y)
                .unwrap();
            assert_eq!(outcome.best_params["tag"], ParamValue::Int(1));
        }
    }

    #[test]
    fn test_failed_combinations_are_discarded() {
        let (x, y) = linear_data(20);
        let grid = ParamGrid::default()
            .with("fail", vec![ParamValue::Int(1), ParamValue::Int(0)])
            .with("scale", floats(&[3.0, 2.0]));
        let outcome = HyperparameterSearch::new(grid, 2, Scoring::NegMeanAbsoluteError)
            .search(&ScaledEstimator, &x, &y)
            .unwrap();

        assert_eq!(outcome.best_params["fail"], ParamValue::Int(0));
        assert_eq!(outcome.best_params["scale"], ParamValue::Float(2.0));
        assert_eq!(
            outcome.scores.iter().filter(|s| s.mean_score.is_none()).count(),
            2
        );
    }

    #[test]
    fn test_all_failures_is_training_error() {
        let (x, y) = linear_data(20);
        let grid = ParamGrid::default().with("fail", vec![ParamValue::Int(1)]);
        let result = HyperparameterSearch::new(grid, 2, Scoring::R2).search(&ScaledEstimator, &x, &y);
        assert!(matches!(result, Err(PipelineError::Training(_))));
    }

    #[test]
    fn test_insufficient_data() {
        let (x, y) = linear_data(2);
        let search = HyperparameterSearch::new(ParamGrid::default(), 3, Scoring::default());
        assert!(matches!(
            search.search(&ScaledEstimator, &x, &y),
            Err(PipelineError::DataInsufficient { required: 3, available: 2, .. })
        ));

        let (x, _) = linear_data(10);
        assert!(matches!(
            search.search(&ScaledEstimator, &x, &[1.0, 2.0]),
            Err(PipelineError::DataInsufficient { .. })
        ));

        // 4 rows: 1 held out leaves 3 training rows, fewer than 4 folds
        let (x, y) = linear_data(4);
        let search = HyperparameterSearch::new(ParamGrid::default(), 4, Scoring::default());
        assert!(matches!(
            search.search(&ScaledEstimator, &x, &y),
            Err(PipelineError::DataInsufficient { .. })
        ));
    }

    #[test]
    fn test_invalid_fold_count() {
        let (x, y) = linear_data(10);
        let search = HyperparameterSearch::new(ParamGrid::default(), 1, Scoring::default());
        assert!(matches!(
            search.search(&ScaledEstimator, &x, &y),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_forest_search_is_deterministic() {
        let x = Array2::from_shape_fn((60, 3), |(i, j)| ((i * (j + 2)) % 17) as f64);
        let y: Vec<f64> = (0..60).map(|i| 100.0 + ((i * 3) % 17) as f64 * 0.5).collect();
        let grid = ParamGrid::default()
            .with("n_estimators", vec![ParamValue::Int(5), ParamValue::Int(10)])
            .with("max_depth", vec![ParamValue::Int(3)]);
        let search = HyperparameterSearch::new(grid, 3, Scoring::default());

        let first = search.search(&ForestEstimator::new(42), &x, &y).unwrap();
        let second = search.search(&ForestEstimator::new(42), &x, &y).unwrap();
        assert_eq!(first.best_params, second.best_params);
        assert_eq!(first.metrics, second.metrics);
        assert!(first.metrics.rmse_val.is_finite());
    }
}
