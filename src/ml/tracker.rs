use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::gate::AuditRecord;
use super::model::ParamSet;

/// Paired actual/predicted values written as a diagnostic artifact
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticSeries {
    pub name: String,
    pub actual: Vec<f64>,
    pub predicted: Vec<f64>,
}

impl DiagnosticSeries {
    pub fn new(name: impl Into<String>, (actual, predicted): (Vec<f64>, Vec<f64>)) -> Self {
        Self {
            name: name.into(),
            actual,
            predicted,
        }
    }
}

/// A logged training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub experiment: String,
    pub params: ParamSet,
    pub metrics: BTreeMap<String, f64>,
    pub artifacts: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// Where training runs are recorded. Failures never affect the promotion decision.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    async fn log_run(
        &self,
        experiment: String,
        params: ParamSet,
        metrics: BTreeMap<String, f64>,
        artifacts: Vec<DiagnosticSeries>,
    ) -> Result<Uuid>;

    async fn fetch_latest_run(&self, experiment: String) -> Result<Option<RunRecord>>;
}

/// Append-only log of pipeline outcomes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_audit(&self, record: AuditRecord) -> Result<()>;

    /// Newest first
    async fn recent_audits(&self, limit: u32) -> Result<Vec<AuditRecord>>;
}

/// Keeps runs and audits in process memory (tracking disabled, tests)
#[derive(Default)]
pub struct InMemoryTracker {
    runs: RwLock<Vec<RunRecord>>,
    audits: RwLock<Vec<AuditRecord>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[async_trait]
impl ExperimentTracker for InMemoryTracker {
    async fn log_run(
        &self,
        experiment: String,
        params: ParamSet,
        metrics: BTreeMap<String, f64>,
        _artifacts: Vec<DiagnosticSeries>,
    ) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        debug!("Logged run {} for {}", run_id, experiment);
        self.runs.write().await.push(RunRecord {
            run_id,
            experiment,
            params,
            metrics,
            artifacts: Vec::new(),
            created_at: Utc::now(),
        });
        Ok(run_id)
    }

    async fn fetch_latest_run(&self, experiment: String) -> Result<Option<RunRecord>> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.experiment == experiment)
            .cloned())
    }
}

#[async_trait]
impl AuditLog for InMemoryTracker {
    async fn record_audit(&self, record: AuditRecord) -> Result<()> {
        self.audits.write().await.push(record);
        Ok(())
    }

    async fn recent_audits(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        Ok(self
            .audits
            .read()
            .await
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::ParamValue;

    #[tokio::test]
    async fn test_latest_run_per_experiment() {
        let tracker = InMemoryTracker::new();
        let params = ParamSet::from([("max_depth".to_string(), ParamValue::Int(5))]);

        let first = tracker
            .log_run("btc".into(), params.clone(), BTreeMap::new(), vec![])
            .await
            .unwrap();
        tracker
            .log_run("eth".into(), params.clone(), BTreeMap::new(), vec![])
            .await
            .unwrap();

        let latest = tracker.fetch_latest_run("btc".into()).await.unwrap().unwrap();
        assert_eq!(latest.run_id, first);
        assert_eq!(latest.params, params);
        assert!(tracker.fetch_latest_run("sol".into()).await.unwrap().is_none());
        assert_eq!(tracker.run_count().await, 2);
    }

    #[tokio::test]
    async fn test_recent_audits_newest_first() {
        let tracker = InMemoryTracker::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            tracker.record_audit(AuditRecord::error(*id, "boom")).await.unwrap();
        }

        let recent = tracker.recent_audits(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, ids[2]);
        assert_eq!(recent[1].run_id, ids[1]);
    }
}
