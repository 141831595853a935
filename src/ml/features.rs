use chrono::{DateTime, FixedOffset};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{Observation, RawObservation};

/// One supervised row derived from a trailing window of observations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub timestamp: DateTime<FixedOffset>,
    pub hour: u32,
    pub day_of_week: u32,
    /// `lags[j - 1]` is the price `j` steps before `timestamp`
    pub lags: Vec<f64>,
    pub rolling_mean: f64,
    pub rolling_std: f64,
}

impl FeatureRow {
    /// Values in `feature_cols` order
    pub fn to_vec(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.lags.len() + 4);
        values.push(self.hour as f64);
        values.push(self.day_of_week as f64);
        values.extend_from_slice(&self.lags);
        values.push(self.rolling_mean);
        values.push(self.rolling_std);
        values
    }
}

/// Ordered (features, label) pairs; label is the price at the row's timestamp
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub rows: Vec<FeatureRow>,
    pub labels: Vec<f64>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Dense `len × n_features` matrix in `feature_cols` order
    pub fn features_matrix(&self) -> Array2<f64> {
        let n_features = self.rows.first().map(|r| r.to_vec().len()).unwrap_or(0);
        let mut matrix = Array2::<f64>::zeros((self.rows.len(), n_features));
        for (i, row) in self.rows.iter().enumerate() {
            for (j, value) in row.to_vec().into_iter().enumerate() {
                matrix[[i, j]] = value;
            }
        }
        matrix
    }

    /// The most recent row without its label
    pub fn snapshot(&self, feature_cols: &[String]) -> Option<FeatureSnapshot> {
        self.rows
            .last()
            .map(|row| FeatureSnapshot::from_row(row, feature_cols))
    }
}

/// Named feature values captured at training time and replayed at serving time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub timestamp: DateTime<FixedOffset>,
    pub feature_cols: Vec<String>,
    pub values: Vec<f64>,
}

impl FeatureSnapshot {
    pub fn from_row(row: &FeatureRow, feature_cols: &[String]) -> Self {
        Self {
            timestamp: row.timestamp,
            feature_cols: feature_cols.to_vec(),
            values: row.to_vec(),
        }
    }

    /// Single-row matrix for a regressor
    pub fn to_matrix(&self) -> Array2<f64> {
        Array2::from_shape_vec((1, self.values.len()), self.values.clone())
            .unwrap_or_else(|_| Array2::zeros((1, 0)))
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.feature_cols
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i).copied())
    }
}

/// Turns a raw price series into a lagged / rolling supervised dataset.
///
/// Lags use strictly prior samples. Rolling mean and sample standard deviation
/// cover the trailing `rolling_window` samples *including* the current one; the
/// serving snapshot is produced by this same builder, so the policy holds at
/// serve time too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureBuilder {
    lag_count: usize,
    rolling_window: usize,
}

impl FeatureBuilder {
    pub fn new(lag_count: usize, rolling_window: usize) -> PipelineResult<Self> {
        if lag_count == 0 {
            return Err(PipelineError::InvalidConfig(
                "lag_count must be >= 1".to_string(),
            ));
        }
        if rolling_window < 2 {
            return Err(PipelineError::InvalidConfig(
                "rolling_window must be >= 2".to_string(),
            ));
        }
        Ok(Self {
            lag_count,
            rolling_window,
        })
    }

    /// Leading rows that can never have a complete feature vector
    pub fn warmup(&self) -> usize {
        self.lag_count.max(self.rolling_window - 1)
    }

    pub fn feature_cols(&self) -> Vec<String> {
        let mut cols = vec!["hour".to_string(), "day_of_week".to_string()];
        cols.extend((1..=self.lag_count).map(|j| format!("lag_{}", j)));
        cols.push(format!("rolling_mean_{}", self.rolling_window));
        cols.push(format!("rolling_std_{}", self.rolling_window));
        cols
    }

    /// Drop unparseable rows, sort ascending, keep the last of any duplicated timestamp
    pub fn clean(raw: &[RawObservation]) -> Vec<Observation> {
        let parsed: Vec<Observation> = raw.iter().filter_map(RawObservation::parse).collect();
        let dropped = raw.len() - parsed.len();
        if dropped > 0 {
            debug!("Dropped {} unparseable observations", dropped);
        }
        sort_and_dedup(parsed)
    }

    pub fn build(&self, raw: &[RawObservation]) -> (Dataset, Vec<String>) {
        self.build_observations(Self::clean(raw))
    }

    /// Build from already-typed observations (sorted and deduplicated here as well)
    pub fn build_observations(&self, observations: Vec<Observation>) -> (Dataset, Vec<String>) {
        let observations = sort_and_dedup(observations);
        let feature_cols = self.feature_cols();
        let warmup = self.warmup();

        if observations.len() <= warmup {
            debug!(
                "Only {} observations for warmup of {}; dataset is empty",
                observations.len(),
                warmup
            );
            return (Dataset::default(), feature_cols);
        }

        let prices: Vec<f64> = observations.iter().map(|o| o.price).collect();
        let w = self.rolling_window;
        let mut dataset = Dataset {
            rows: Vec::with_capacity(observations.len() - warmup),
            labels: Vec::with_capacity(observations.len() - warmup),
        };

        for (i, obs) in observations.iter().enumerate().skip(warmup) {
            let lags: Vec<f64> = (1..=self.lag_count).map(|j| prices[i - j]).collect();

            let window = &prices[i + 1 - w..=i];
            let mean = window.iter().sum::<f64>() / w as f64;
            let variance =
                window.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (w - 1) as f64;

            dataset.rows.push(FeatureRow {
                timestamp: obs.timestamp,
                hour: obs.hour(),
                day_of_week: obs.day_of_week(),
                lags,
                rolling_mean: mean,
                rolling_std: variance.sqrt(),
            });
            dataset.labels.push(obs.price);
        }

        debug!(
            "Built {} feature rows from {} observations (k={}, w={})",
            dataset.len(),
            observations.len(),
            self.lag_count,
            w
        );
        (dataset, feature_cols)
    }
}

fn sort_and_dedup(mut observations: Vec<Observation>) -> Vec<Observation> {
    observations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    let mut out: Vec<Observation> = Vec::with_capacity(observations.len());
    for obs in observations {
        match out.last_mut() {
            Some(last) if last.timestamp == obs.timestamp => *last = obs,
            _ => out.push(obs),
        }
    }
    out
}
