use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the train → evaluate → promote → serve core
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Insufficient data: need at least {required}, got {available} ({reason})")]
    DataInsufficient {
        required: usize,
        available: usize,
        reason: String,
    },

    #[error("Training failed: {0}")]
    Training(String),

    #[error("Prediction failed: {0}")]
    Prediction(String),

    #[error("Failed to load champion: {0}")]
    ChampionLoad(String),

    #[error("No champion model has been promoted yet")]
    NoChampion,

    #[error("Champion has no feature snapshot")]
    NoSnapshot,

    #[error("Feature columns differ: model expects {expected:?}, snapshot has {actual:?}")]
    FeatureMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the champion store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Corrupt champion pointer: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_insufficient_message() {
        let err = PipelineError::DataInsufficient {
            required: 3,
            available: 2,
            reason: "cv folds".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient data: need at least 3, got 2 (cv folds)"
        );
    }

    #[test]
    fn test_store_error_converts() {
        let store = StoreError::Corrupt("bad version".to_string());
        let err: PipelineError = store.into();
        assert!(matches!(err, PipelineError::Store(StoreError::Corrupt(_))));
    }
}
