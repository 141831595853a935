use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::StoreError;
use crate::ml::features::FeatureSnapshot;
use crate::ml::model::ModelArtifact;

pub mod file;
pub mod sled_store;

pub use file::FileModelStore;
pub use sled_store::SledModelStore;

/// Semantic version for champion models
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModelVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn initial() -> Self {
        Self::new(1, 0, 0)
    }

    pub fn bump_patch(&self) -> Self {
        Self::new(self.major, self.minor, self.patch + 1)
    }

    /// Version a promotion after `current` receives
    pub fn next_after(current: Option<&ModelVersion>) -> Self {
        current.map(|v| v.bump_patch()).unwrap_or_else(Self::initial)
    }
}

impl FromStr for ModelVersion {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, StoreError> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(StoreError::Corrupt(format!("invalid version format: {}", s)));
        }
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| StoreError::Corrupt(format!("invalid version component in {}", s)))
        };
        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
        })
    }
}

impl std::fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Champion artifact and the snapshot promoted with it, under one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionPair<M> {
    pub version: ModelVersion,
    pub artifact: ModelArtifact<M>,
    pub snapshot: Option<FeatureSnapshot>,
}

/// Owner of the single champion slot.
///
/// `put_champion` replaces artifact and snapshot as one unit; a reader sees
/// either the previous pair or the new one, never a mix.
#[async_trait]
pub trait ModelStore<M>: Send + Sync
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Resolve the champion pointer once and read both halves of the pair
    async fn get_pair(&self) -> Result<Option<ChampionPair<M>>, StoreError>;

    async fn put_champion(
        &self,
        artifact: ModelArtifact<M>,
        snapshot: FeatureSnapshot,
    ) -> Result<ModelVersion, StoreError>;

    async fn current_version(&self) -> Result<Option<ModelVersion>, StoreError>;

    async fn get_champion(&self) -> Result<Option<ModelArtifact<M>>, StoreError> {
        Ok(self.get_pair().await?.map(|pair| pair.artifact))
    }

    async fn get_snapshot(&self) -> Result<Option<FeatureSnapshot>, StoreError> {
        Ok(self.get_pair().await?.and_then(|pair| pair.snapshot))
    }
}

/// Process-local store; the pair is kept serialized, as a real backend would
#[derive(Default)]
pub struct InMemoryModelStore {
    slot: RwLock<Option<(ModelVersion, Vec<u8>)>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored bytes, leaving the version pointer in place
    #[cfg(test)]
    pub async fn corrupt(&self) {
        let mut slot = self.slot.write().await;
        let version = slot
            .as_ref()
            .map(|(v, _)| v.clone())
            .unwrap_or_else(ModelVersion::initial);
        *slot = Some((version, b"{not json".to_vec()));
    }
}

#[async_trait]
impl<M> ModelStore<M> for InMemoryModelStore
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get_pair(&self) -> Result<Option<ChampionPair<M>>, StoreError> {
        let slot = self.slot.read().await;
        match slot.as_ref() {
            Some((_, bytes)) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_champion(
        &self,
        artifact: ModelArtifact<M>,
        snapshot: FeatureSnapshot,
    ) -> Result<ModelVersion, StoreError> {
        let mut slot = self.slot.write().await;
        let version = ModelVersion::next_after(slot.as_ref().map(|(v, _)| v));
        let pair = ChampionPair {
            version: version.clone(),
            artifact,
            snapshot: Some(snapshot),
        };
        let bytes = serde_json::to_vec(&pair)?;
        *slot = Some((version.clone(), bytes));
        info!("Champion v{} stored in memory", version);
        Ok(version)
    }

    async fn current_version(&self) -> Result<Option<ModelVersion>, StoreError> {
        Ok(self.slot.read().await.as_ref().map(|(v, _)| v.clone()))
    }
}

/// Shared fixtures for the backend tests
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::ml::model::testing::ConstantRegressor;
    use crate::ml::model::{ModelMetrics, ParamSet, ParamValue};
    use chrono::DateTime;

    pub fn artifact(value: f64, rmse_val: f64) -> ModelArtifact<ConstantRegressor> {
        ModelArtifact::new(
            "constant",
            ConstantRegressor(value),
            ParamSet::from([("n_estimators".to_string(), ParamValue::Int(50))]),
            ModelMetrics {
                rmse_train: rmse_val / 2.0,
                rmse_val,
                r2_train: 0.9,
                r2_val: 0.8,
                train_samples: 80,
                val_samples: 20,
            },
            vec!["hour".to_string(), "lag_1".to_string()],
        )
    }

    pub fn snapshot(lag: f64) -> FeatureSnapshot {
        FeatureSnapshot {
            timestamp: DateTime::parse_from_rfc3339("2025-05-05T15:00:00-04:00").unwrap(),
            feature_cols: vec!["hour".to_string(), "lag_1".to_string()],
            values: vec![15.0, lag],
        }
    }
}
