use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};

/// A scalar hyperparameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Int(v) => *v as f64,
            ParamValue::Float(v) => *v,
        }
    }

    /// Non-negative integral value, if representable
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            ParamValue::Int(v) if *v >= 0 => Some(*v as usize),
            ParamValue::Float(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as usize),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One point of a parameter grid, keyed by parameter name
pub type ParamSet = BTreeMap<String, ParamValue>;

pub fn format_params(params: &ParamSet) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Anything that maps a feature matrix to point predictions
pub trait Regressor: Send + Sync {
    fn predict(&self, x: &Array2<f64>) -> PipelineResult<Vec<f64>>;
}

/// Fits a regressor from a feature matrix, labels and one parameter set
pub trait Estimator: Send + Sync {
    type Model: Regressor + Serialize + DeserializeOwned + Send + 'static;

    fn name(&self) -> &str;

    fn fit(&self, x: &Array2<f64>, y: &[f64], params: &ParamSet) -> PipelineResult<Self::Model>;
}

/// Train/validation metrics reported for every candidate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub rmse_train: f64,
    pub rmse_val: f64,
    pub r2_train: f64,
    pub r2_val: f64,
    pub train_samples: usize,
    pub val_samples: usize,
}

impl ModelMetrics {
    pub fn as_map(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("rmse_train".to_string(), self.rmse_train),
            ("rmse_val".to_string(), self.rmse_val),
            ("r2_train".to_string(), self.r2_train),
            ("r2_val".to_string(), self.r2_val),
        ])
    }
}

/// A fitted model plus everything needed to reproduce and compare it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact<M> {
    pub id: Uuid,
    pub estimator: String,
    pub model: M,
    pub params: ParamSet,
    pub metrics: ModelMetrics,
    pub feature_cols: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl<M> ModelArtifact<M> {
    pub fn new(
        estimator: impl Into<String>,
        model: M,
        params: ParamSet,
        metrics: ModelMetrics,
        feature_cols: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            estimator: estimator.into(),
            model,
            params,
            metrics,
            feature_cols,
            created_at: Utc::now(),
        }
    }
}

pub fn mean_squared_error(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return f64::NAN;
    }
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum::<f64>()
        / actual.len() as f64
}

pub fn root_mean_squared_error(actual: &[f64], predicted: &[f64]) -> f64 {
    mean_squared_error(actual, predicted).sqrt()
}

pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return f64::NAN;
    }
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

/// Coefficient of determination; a constant target scores 1.0 if fit exactly, else 0.0
pub fn r2_score(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return f64::NAN;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Random forest regressor backed by smartcore
#[derive(Serialize, Deserialize)]
pub struct ForestRegressor {
    forest: Forest,
    n_features: usize,
}

impl fmt::Debug for ForestRegressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForestRegressor")
            .field("n_features", &self.n_features)
            .finish_non_exhaustive()
    }
}

impl Regressor for ForestRegressor {
    fn predict(&self, x: &Array2<f64>) -> PipelineResult<Vec<f64>> {
        if x.ncols() != self.n_features {
            return Err(PipelineError::Prediction(format!(
                "model expects {} features, got {}",
                self.n_features,
                x.ncols()
            )));
        }
        let dense = to_dense(x).map_err(PipelineError::Prediction)?;
        self.forest
            .predict(&dense)
            .map_err(|e| PipelineError::Prediction(e.to_string()))
    }
}

/// Seeded random forest estimator.
///
/// Recognised parameters: `n_estimators` (default 100), `max_depth` (unbounded
/// when absent), `min_samples_split` (default 2), `min_samples_leaf` (default 1).
#[derive(Debug, Clone)]
pub struct ForestEstimator {
    seed: u64,
}

impl ForestEstimator {
    pub const PARAMS: [&'static str; 4] = [
        "n_estimators",
        "max_depth",
        "min_samples_split",
        "min_samples_leaf",
    ];

    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn parameters(&self, params: &ParamSet) -> PipelineResult<RandomForestRegressorParameters> {
        if let Some(unknown) = params.keys().find(|k| !Self::PARAMS.contains(&k.as_str())) {
            return Err(PipelineError::InvalidConfig(format!(
                "unknown random forest parameter: {}",
                unknown
            )));
        }

        let int_param = |name: &str, default: usize| -> PipelineResult<usize> {
            match params.get(name) {
                None => Ok(default),
                Some(v) => v.as_usize().ok_or_else(|| {
                    PipelineError::InvalidConfig(format!("{} must be a non-negative integer, got {}", name, v))
                }),
            }
        };

        let mut parameters = RandomForestRegressorParameters::default()
            .with_n_trees(int_param("n_estimators", 100)?)
            .with_min_samples_split(int_param("min_samples_split", 2)?)
            .with_min_samples_leaf(int_param("min_samples_leaf", 1)?)
            .with_seed(self.seed);

        if params.contains_key("max_depth") {
            let depth = int_param("max_depth", 0)?;
            parameters = parameters.with_max_depth(depth.min(u16::MAX as usize) as u16);
        }
        Ok(parameters)
    }
}

impl Estimator for ForestEstimator {
    type Model = ForestRegressor;

    fn name(&self) -> &str {
        "random_forest"
    }

    fn fit(&self, x: &Array2<f64>, y: &[f64], params: &ParamSet) -> PipelineResult<ForestRegressor> {
        if x.nrows() != y.len() {
            return Err(PipelineError::Training(format!(
                "{} rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        let parameters = self.parameters(params)?;
        let dense = to_dense(x).map_err(PipelineError::Training)?;
        let labels = y.to_vec();
        let forest = RandomForestRegressor::fit(&dense, &labels, parameters)
            .map_err(|e| PipelineError::Training(e.to_string()))?;
        Ok(ForestRegressor {
            forest,
            n_features: x.ncols(),
        })
    }
}

fn to_dense(x: &Array2<f64>) -> Result<DenseMatrix<f64>, String> {
    let rows: Vec<Vec<f64>> = x.outer_iter().map(|row| row.to_vec()).collect();
    DenseMatrix::from_2d_vec(&rows).map_err(|e| format!("Matrix error: {}", e))
}
