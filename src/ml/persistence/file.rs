use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ChampionPair, ModelStore, ModelVersion};
use crate::error::StoreError;
use crate::ml::features::FeatureSnapshot;
use crate::ml::model::ModelArtifact;

const POINTER_FILE: &str = "CURRENT";
const MODEL_FILE: &str = "model.json";
const SNAPSHOT_FILE: &str = "snapshot.json";
const VERSION_PREFIX: &str = "champion-";
const MIN_RETAINED: usize = 2;

/// Directory-backed champion store.
///
/// Layout:
/// ```text
/// <dir>/CURRENT                    "1.0.4"
/// <dir>/champion-1.0.4/model.json
/// <dir>/champion-1.0.4/snapshot.json
/// ```
/// A version directory is complete before `CURRENT` is swapped to it with a
/// write-then-rename, so readers always resolve a fully written pair.
pub struct FileModelStore {
    dir: PathBuf,
    retain_versions: usize,
}

impl FileModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retain_versions: 3,
        }
    }

    /// Number of version directories kept after a promotion.
    ///
    /// At least the previous version survives a swap, so a reader that
    /// resolved the old pointer can still load both of its files.
    pub fn with_retain_versions(mut self, retain_versions: usize) -> Self {
        self.retain_versions = retain_versions.max(MIN_RETAINED);
        self
    }

    fn pointer_path(&self) -> PathBuf {
        self.dir.join(POINTER_FILE)
    }

    fn version_dir(&self, version: &ModelVersion) -> PathBuf {
        self.dir.join(format!("{}{}", VERSION_PREFIX, version))
    }

    async fn read_pointer(&self) -> Result<Option<ModelVersion>, StoreError> {
        let path = self.pointer_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(ModelVersion::from_str(&contents)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    /// Replace `CURRENT` atomically
    async fn swap_pointer(&self, version: &ModelVersion) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!(".{}.{}", POINTER_FILE, Uuid::new_v4()));
        Self::write_file(&tmp, version.to_string().as_bytes()).await?;
        let target = self.pointer_path();
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| StoreError::io(&target, e))
    }

    /// Versions that have a directory on disk, newest first
    async fn stored_versions(&self) -> Result<Vec<ModelVersion>, StoreError> {
        let mut versions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(v) = name.strip_prefix(VERSION_PREFIX) {
                if let Ok(version) = ModelVersion::from_str(v) {
                    versions.push(version);
                }
            }
        }

        versions.sort_unstable_by(|a, b| b.cmp(a));
        Ok(versions)
    }

    /// Remove version directories beyond `retain_versions`, never the current one
    async fn prune(&self, current: &ModelVersion) -> Result<(), StoreError> {
        let versions = self.stored_versions().await?;
        for old in versions.into_iter().skip(self.retain_versions) {
            if &old == current {
                continue;
            }
            let path = self.version_dir(&old);
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            debug!("Pruned champion v{}", old);
        }
        Ok(())
    }
}

#[async_trait]
impl<M> ModelStore<M> for FileModelStore
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get_pair(&self) -> Result<Option<ChampionPair<M>>, StoreError> {
        let Some(version) = self.read_pointer().await? else {
            return Ok(None);
        };
        let dir = self.version_dir(&version);

        let model_path = dir.join(MODEL_FILE);
        let model_bytes = match tokio::fs::read(&model_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Corrupt(format!(
                    "CURRENT points at v{} but {} is missing",
                    version,
                    model_path.display()
                )));
            }
            Err(e) => return Err(StoreError::io(model_path, e)),
        };
        let artifact: ModelArtifact<M> = serde_json::from_slice(&model_bytes)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let snapshot = match tokio::fs::read(&snapshot_path).await {
            Ok(bytes) => Some(serde_json::from_slice::<FeatureSnapshot>(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(snapshot_path, e)),
        };

        Ok(Some(ChampionPair {
            version,
            artifact,
            snapshot,
        }))
    }

    async fn put_champion(
        &self,
        artifact: ModelArtifact<M>,
        snapshot: FeatureSnapshot,
    ) -> Result<ModelVersion, StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let current = match self.read_pointer().await {
            Ok(current) => current,
            Err(StoreError::Corrupt(reason)) => {
                // Number past every directory on disk so no version is reused
                let latest = self.stored_versions().await?.into_iter().next();
                warn!("Ignoring unreadable champion pointer: {}", reason);
                latest
            }
            Err(e) => return Err(e),
        };
        let version = ModelVersion::next_after(current.as_ref());

        // Stage the whole pair, then move it into place
        let staging = self.dir.join(format!(".staging-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| StoreError::io(&staging, e))?;
        Self::write_file(&staging.join(MODEL_FILE), &serde_json::to_vec(&artifact)?).await?;
        Self::write_file(&staging.join(SNAPSHOT_FILE), &serde_json::to_vec(&snapshot)?).await?;

        let target = self.version_dir(&version);
        if tokio::fs::metadata(&target).await.is_ok() {
            // Left behind by a run that died before swapping the pointer
            warn!("Replacing orphaned {}", target.display());
            tokio::fs::remove_dir_all(&target)
                .await
                .map_err(|e| StoreError::io(&target, e))?;
        }
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| StoreError::io(&target, e))?;

        self.swap_pointer(&version).await?;
        info!("Champion v{} written to {}", version, target.display());

        if let Err(e) = self.prune(&version).await {
            warn!("Failed to prune old champions: {}", e);
        }
        Ok(version)
    }

    async fn current_version(&self) -> Result<Option<ModelVersion>, StoreError> {
        self.read_pointer().await
    }
}
