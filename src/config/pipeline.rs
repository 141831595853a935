use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ml::search::{ParamGrid, Scoring, SplitPolicy};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataSettings,
    pub features: FeatureSettings,
    pub search: SearchSettings,
    pub store: StoreSettings,
    pub tracking: TrackingSettings,
    pub notifications: NotificationSettings,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Feature validation
        if self.features.lag_count == 0 {
            errors.push("features.lag_count must be >= 1".to_string());
        }
        if self.features.rolling_window < 2 {
            errors.push("features.rolling_window must be >= 2".to_string());
        }

        // Search validation
        if self.search.cv_folds < 2 {
            errors.push("search.cv_folds must be >= 2".to_string());
        }
        if !(self.search.holdout_fraction > 0.0 && self.search.holdout_fraction < 1.0) {
            errors.push("search.holdout_fraction must be between 0 and 1".to_string());
        }
        if self.search.grid.names().next().is_none() {
            errors.push("search.grid must name at least one parameter".to_string());
        }
        for (name, values) in self.search.grid.iter() {
            if values.is_empty() {
                errors.push(format!("search.grid.{} has no values", name));
            }
        }
        if self.search.max_threads == Some(0) {
            errors.push("search.max_threads must be > 0 when set".to_string());
        }

        // Store validation
        if self.store.retain_versions < 2 {
            errors.push("store.retain_versions must be >= 2".to_string());
        }

        // Notification validation
        let telegram = &self.notifications;
        if telegram.telegram_enabled && (telegram.bot_token.is_none() || telegram.chat_id.is_none()) {
            errors.push("notifications: telegram needs bot_token and chat_id".to_string());
        }
        if telegram.timeout_secs == 0 {
            errors.push("notifications.timeout_secs must be > 0".to_string());
        }

        if self.data.timestamp_column.trim().is_empty() || self.data.price_column.trim().is_empty() {
            errors.push("data: column names must not be blank".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub input: PathBuf,
    pub timestamp_column: String,
    pub price_column: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            input: PathBuf::from("data/prices.csv"),
            timestamp_column: "Datetime".to_string(),
            price_column: "Close".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub lag_count: usize,
    pub rolling_window: usize,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            lag_count: 3,
            rolling_window: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub cv_folds: usize,
    pub scoring: Scoring,
    pub holdout_fraction: f64,
    pub seed: u64,
    pub max_threads: Option<usize>,
    pub grid: ParamGrid,
}

impl SearchSettings {
    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy {
            holdout_fraction: self.holdout_fraction,
            seed: self.seed,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        let split = SplitPolicy::default();
        Self {
            cv_folds: 3,
            scoring: Scoring::default(),
            holdout_fraction: split.holdout_fraction,
            seed: split.seed,
            max_threads: None,
            grid: ParamGrid::forest_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Sled,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub path: PathBuf,
    pub retain_versions: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: PathBuf::from("models"),
            retain_versions: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// When false, runs and audits are kept in memory only
    pub enabled: bool,
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub experiment: String,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: "sqlite://pricecast.db".to_string(),
            artifacts_dir: PathBuf::from("artifacts"),
            experiment: "pricecast".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub telegram_enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            telegram_enabled: false,
            bot_token: None,
            chat_id: None,
            timeout_secs: 10,
        }
    }
}
