use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use super::{ChampionPair, ModelStore, ModelVersion};
use crate::error::StoreError;
use crate::ml::features::FeatureSnapshot;
use crate::ml::model::ModelArtifact;

const TREE: &str = "champion";
const PAIR_KEY: &[u8] = b"pair";
const VERSION_KEY: &[u8] = b"version";

/// Reads only the version field of a stored pair
#[derive(Deserialize)]
struct PairVersion {
    version: ModelVersion,
}

/// Embedded key-value champion store.
///
/// The pair and its version are committed in one atomic batch and flushed
/// before `put_champion` returns.
pub struct SledModelStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledModelStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree(TREE)?;
        Ok(Self { db, tree })
    }

    #[cfg(test)]
    fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(TREE)?;
        Ok(Self { db, tree })
    }

    fn read_version(&self) -> Result<Option<ModelVersion>, StoreError> {
        match self.tree.get(VERSION_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Version the next promotion follows.
    ///
    /// An unreadable version key falls back to the version inside the pair,
    /// or to none at all, so a damaged entry is overwritten instead of
    /// failing every promotion.
    fn latest_version(&self) -> Result<Option<ModelVersion>, StoreError> {
        match self.read_version() {
            Err(StoreError::Serialization(e)) => {
                warn!("Ignoring unreadable champion version: {}", e);
                Ok(self
                    .tree
                    .get(PAIR_KEY)?
                    .and_then(|bytes| serde_json::from_slice::<PairVersion>(&bytes).ok())
                    .map(|pair| pair.version))
            }
            other => other,
        }
    }
}

#[async_trait]
impl<M> ModelStore<M> for SledModelStore
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get_pair(&self) -> Result<Option<ChampionPair<M>>, StoreError> {
        match self.tree.get(PAIR_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_champion(
        &self,
        artifact: ModelArtifact<M>,
        snapshot: FeatureSnapshot,
    ) -> Result<ModelVersion, StoreError> {
        let version = ModelVersion::next_after(self.latest_version()?.as_ref());
        let pair = ChampionPair {
            version: version.clone(),
            artifact,
            snapshot: Some(snapshot),
        };

        let mut batch = sled::Batch::default();
        batch.insert(PAIR_KEY, serde_json::to_vec(&pair)?);
        batch.insert(VERSION_KEY, serde_json::to_vec(&version)?);
        self.tree.apply_batch(batch)?;
        self.db.flush_async().await?;

        info!("Champion v{} committed to sled", version);
        Ok(version)
    }

    async fn current_version(&self) -> Result<Option<ModelVersion>, StoreError> {
        self.read_version()
    }
}
