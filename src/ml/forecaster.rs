use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::model::Regressor;
use super::persistence::{ModelStore, ModelVersion};
use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, FixedOffset};

/// One-step-ahead forecast with the provenance needed to report it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub value: f64,
    pub version: ModelVersion,
    /// Timestamp of the last observation the snapshot was built from
    pub as_of: DateTime<FixedOffset>,
}

/// Serves predictions from the stored champion and its snapshot
pub struct Forecaster<M> {
    store: Arc<dyn ModelStore<M>>,
}

impl<M> Forecaster<M>
where
    M: Regressor + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn ModelStore<M>>) -> Self {
        Self { store }
    }

    pub async fn predict_next(&self) -> PipelineResult<f64> {
        Ok(self.forecast().await?.value)
    }

    pub async fn forecast(&self) -> PipelineResult<Forecast> {
        let pair = self
            .store
            .get_pair()
            .await
            .map_err(|e| PipelineError::ChampionLoad(e.to_string()))?
            .ok_or(PipelineError::NoChampion)?;
        let snapshot = pair.snapshot.ok_or(PipelineError::NoSnapshot)?;

        if snapshot.feature_cols != pair.artifact.feature_cols {
            return Err(PipelineError::FeatureMismatch {
                expected: pair.artifact.feature_cols,
                actual: snapshot.feature_cols,
            });
        }

        let predictions = pair.artifact.model.predict(&snapshot.to_matrix())?;
        let value = predictions
            .first()
            .copied()
            .ok_or_else(|| PipelineError::Prediction("model returned no prediction".to_string()))?;
        debug!("Champion v{} forecast {:.4} from {}", pair.version, value, snapshot.timestamp);

        Ok(Forecast {
            value,
            version: pair.version,
            as_of: snapshot.timestamp,
        })
    }
}
