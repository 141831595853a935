use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::data::ObservationSource;
use crate::error::PipelineError;
use crate::ml::features::FeatureBuilder;
use crate::ml::gate::{AuditRecord, GateOutcome, PromotionDecision, PromotionGate};
use crate::ml::model::{format_params, Estimator, ModelArtifact, ParamSet};
use crate::ml::persistence::ModelStore;
use crate::ml::search::HyperparameterSearch;
use crate::ml::tracker::{AuditLog, DiagnosticSeries, ExperimentTracker, InMemoryTracker};
use crate::notifications::{AlertType, NotificationManager};

/// Summary of one training run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub audit: AuditRecord,
    pub decision: Option<PromotionDecision>,
    pub best_params: Option<ParamSet>,
    pub cv_score: Option<f64>,
    /// Id assigned by the experiment tracker, if logging succeeded
    pub tracked_run: Option<Uuid>,
    pub elapsed_ms: u128,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.decision.is_some()
    }
}

struct StageOutput {
    gate: GateOutcome,
    best_params: ParamSet,
    cv_score: f64,
    tracked_run: Option<Uuid>,
}

/// Fetch → build features → search → gate → track, then audit and notify once
pub struct TrainingPipeline<E: Estimator> {
    estimator: Arc<E>,
    builder: FeatureBuilder,
    search: HyperparameterSearch,
    gate: PromotionGate<E::Model>,
    tracker: Arc<dyn ExperimentTracker>,
    audit_log: Arc<dyn AuditLog>,
    notifications: Arc<NotificationManager>,
    experiment: String,
}

impl<E> TrainingPipeline<E>
where
    E: Estimator + 'static,
{
    pub fn new(
        estimator: E,
        builder: FeatureBuilder,
        search: HyperparameterSearch,
        store: Arc<dyn ModelStore<E::Model>>,
    ) -> Self {
        let memory = Arc::new(InMemoryTracker::new());
        Self {
            estimator: Arc::new(estimator),
            builder,
            search,
            gate: PromotionGate::new(store),
            tracker: memory.clone(),
            audit_log: memory,
            notifications: Arc::new(NotificationManager::default()),
            experiment: "pricecast".to_string(),
        }
    }

    pub fn with_tracking(
        mut self,
        tracker: Arc<dyn ExperimentTracker>,
        audit_log: Arc<dyn AuditLog>,
    ) -> Self {
        self.tracker = tracker;
        self.audit_log = audit_log;
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<NotificationManager>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = experiment.into();
        self
    }

    /// Run once. Failures are reported in the audit record rather than returned.
    pub async fn run(&self, source: &dyn ObservationSource) -> RunReport {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        info!("Starting training run {}", run_id);

        let (audit, decision, best_params, cv_score, tracked_run) =
            match self.execute(run_id, source).await {
                Ok(out) => (
                    out.gate.audit,
                    Some(out.gate.decision),
                    Some(out.best_params),
                    Some(out.cv_score),
                    out.tracked_run,
                ),
                Err(e) => {
                    error!("Run {} failed: {:#}", run_id, e);
                    (AuditRecord::error(run_id, format!("{:#}", e)), None, None, None, None)
                }
            };

        if let Err(e) = self.audit_log.record_audit(audit.clone()).await {
            error!("Failed to record audit for run {}: {}", run_id, e);
        }
        self.notifications.notify(AlertType::from_audit(&audit)).await;

        let elapsed_ms = started.elapsed().as_millis();
        info!("Run {} finished: {} in {}ms", run_id, audit.outcome.as_str(), elapsed_ms);

        RunReport {
            run_id,
            audit,
            decision,
            best_params,
            cv_score,
            tracked_run,
            elapsed_ms,
        }
    }

    async fn execute(&self, run_id: Uuid, source: &dyn ObservationSource) -> Result<StageOutput> {
        let raw = source.fetch().await.context("fetching observations")?;

        let (dataset, feature_cols) = self.builder.build(&raw);
        info!(
            "Built {} feature rows from {} raw observations ({} features)",
            dataset.len(),
            raw.len(),
            feature_cols.len()
        );
        let snapshot = dataset
            .snapshot(&feature_cols)
            .ok_or_else(|| PipelineError::DataInsufficient {
                required: self.builder.warmup() + 1,
                available: raw.len(),
                reason: "no complete feature rows".to_string(),
            })?;

        let x = dataset.features_matrix();
        let y = dataset.labels;
        let search = self.search.clone();
        let estimator = self.estimator.clone();
        let outcome = tokio::task::spawn_blocking(move || search.search(estimator.as_ref(), &x, &y))
            .await
            .context("search task panicked")??;

        let artifact = ModelArtifact::new(
            self.estimator.name(),
            outcome.best_model,
            outcome.best_params.clone(),
            outcome.metrics,
            feature_cols,
        );
        let gate = self
            .gate
            .evaluate(run_id, artifact, snapshot, &outcome.validation)
            .await?;

        let mut metrics = outcome.metrics.as_map();
        metrics.insert("cv_score".to_string(), outcome.cv_score);
        let diagnostics = vec![
            DiagnosticSeries::new("train", outcome.train_predictions),
            DiagnosticSeries::new("validation", outcome.val_predictions),
        ];
        let tracked_run = match self
            .tracker
            .log_run(self.experiment.clone(), outcome.best_params.clone(), metrics, diagnostics)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Experiment tracking failed, decision stands: {}", e);
                None
            }
        };

        info!("Run {} used {}", run_id, format_params(&outcome.best_params));
        Ok(StageOutput {
            gate,
            best_params: outcome.best_params,
            cv_score: outcome.cv_score,
            tracked_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::forecaster::Forecaster;
    use crate::ml::gate::AuditOutcome;
    use crate::ml::model::testing::{ScaledEstimator, ScaledRegressor};
    use crate::ml::model::ParamValue;
    use crate::ml::persistence::{InMemoryModelStore, ModelVersion};
    use crate::ml::search::{ParamGrid, Scoring};
    use crate::ml::tracker::MockExperimentTracker;
    use crate::notifications::MockNotifier;
    use crate::types::RawObservation;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};

    struct StaticSource(Vec<RawObservation>);

    #[async_trait]
    impl ObservationSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<RawObservation>> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ObservationSource for FailingSource {
        async fn fetch(&self) -> Result<Vec<RawObservation>> {
            Err(anyhow::anyhow!("provider unavailable"))
        }
    }

    /// Price equals twice the UTC hour, so `scale = 2` fits exactly
    fn hourly_series(hours: i64) -> StaticSource {
        let start = Utc.with_ymd_and_hms(2025, 5, 5, 0, 0, 0).unwrap();
        StaticSource(
            (0..hours)
                .map(|h| {
                    let ts = start + Duration::hours(h);
                    RawObservation::new(ts.to_rfc3339(), format!("{}", 2 * (h % 24)))
                })
                .collect(),
        )
    }

    fn search() -> HyperparameterSearch {
        let floats = |vals: &[f64]| vals.iter().map(|v| ParamValue::Float(*v)).collect();
        HyperparameterSearch::new(
            ParamGrid::default().with("scale", floats(&[1.0, 2.0, 3.0])),
            3,
            Scoring::NegMeanSquaredError,
        )
    }

    fn notifier_expecting(runs: usize) -> Arc<NotificationManager> {
        let mut notifier = MockNotifier::new();
        notifier.expect_send().times(runs).returning(|_| Ok(()));
        Arc::new(NotificationManager::new(Arc::new(notifier)))
    }

    fn pipeline(
        store: Arc<InMemoryModelStore>,
        tracker: Arc<InMemoryTracker>,
        notifications: Arc<NotificationManager>,
    ) -> TrainingPipeline<ScaledEstimator> {
        TrainingPipeline::new(
            ScaledEstimator,
            FeatureBuilder::new(1, 2).unwrap(),
            search(),
            store,
        )
        .with_tracking(tracker.clone(), tracker)
        .with_notifications(notifications)
        .with_experiment("test")
    }

    #[tokio::test]
    async fn test_first_run_promotes_then_equal_run_is_rejected() {
        let store = Arc::new(InMemoryModelStore::new());
        let tracker = Arc::new(InMemoryTracker::new());
        let pipeline = pipeline(store.clone(), tracker.clone(), notifier_expecting(2));
        let source = hourly_series(48);

        let first = pipeline.run(&source).await;
        assert_eq!(first.decision, Some(PromotionDecision::Promoted));
        assert_eq!(first.audit.promoted_version, Some(ModelVersion::initial()));
        assert_eq!(first.best_params.unwrap()["scale"], ParamValue::Float(2.0));
        assert_eq!(first.cv_score, Some(0.0));
        assert!(first.tracked_run.is_some());

        // Same data, same perfect fit: a tie never replaces the champion
        let second = pipeline.run(&source).await;
        assert_eq!(second.decision, Some(PromotionDecision::Rejected));
        assert_eq!(
            ModelStore::<ScaledRegressor>::current_version(store.as_ref()).await.unwrap(),
            Some(ModelVersion::initial())
        );

        let audits = tracker.recent_audits(10).await.unwrap();
        assert_eq!(audits.len(), 2);
        assert_eq!(audits[0].outcome, AuditOutcome::Rejected);
        assert_eq!(audits[1].outcome, AuditOutcome::Promoted);
        assert_eq!(tracker.run_count().await, 2);

        // Snapshot is the last row: 23:00 UTC, so 2 * 23
        let forecaster: Forecaster<ScaledRegressor> = Forecaster::new(store);
        assert_eq!(forecaster.predict_next().await.unwrap(), 46.0);
    }

    #[tokio::test]
    async fn test_insufficient_data_is_audited_not_promoted() {
        let store = Arc::new(InMemoryModelStore::new());
        let tracker = Arc::new(InMemoryTracker::new());
        let pipeline = pipeline(store.clone(), tracker.clone(), notifier_expecting(1));

        let report = pipeline.run(&hourly_series(3)).await;
        assert!(!report.succeeded());
        assert_eq!(report.audit.outcome, AuditOutcome::Error);
        assert!(report.audit.reason.contains("Insufficient data"));

        assert!(ModelStore::<ScaledRegressor>::get_champion(store.as_ref())
            .await
            .unwrap()
            .is_none());
        assert_eq!(tracker.recent_audits(10).await.unwrap().len(), 1);
        assert_eq!(tracker.run_count().await, 0);
    }

    #[tokio::test]
    async fn test_source_failure_is_audited() {
        let store = Arc::new(InMemoryModelStore::new());
        let tracker = Arc::new(InMemoryTracker::new());
        let pipeline = pipeline(store, tracker.clone(), notifier_expecting(1));

        let report = pipeline.run(&FailingSource).await;
        assert_eq!(report.audit.outcome, AuditOutcome::Error);
        assert!(report.audit.reason.contains("provider unavailable"));
    }

    #[tokio::test]
    async fn test_tracker_failure_does_not_block_promotion() {
        let store = Arc::new(InMemoryModelStore::new());
        let audits = Arc::new(InMemoryTracker::new());

        let mut tracker = MockExperimentTracker::new();
        tracker
            .expect_log_run()
            .times(1)
            .returning(|_, _, _, _| Err(anyhow::anyhow!("tracking server down")));

        let pipeline = TrainingPipeline::new(
            ScaledEstimator,
            FeatureBuilder::new(1, 2).unwrap(),
            search(),
            store.clone(),
        )
        .with_tracking(Arc::new(tracker), audits.clone())
        .with_notifications(notifier_expecting(1));

        let report = pipeline.run(&hourly_series(48)).await;
        assert_eq!(report.decision, Some(PromotionDecision::Promoted));
        assert!(report.tracked_run.is_none());
        assert!(ModelStore::<ScaledRegressor>::get_champion(store.as_ref())
            .await
            .unwrap()
            .is_some());
        assert_eq!(audits.recent_audits(1).await.unwrap()[0].outcome, AuditOutcome::Promoted);
    }

    #[tokio::test]
    async fn test_all_failing_combinations_is_an_error() {
        let store = Arc::new(InMemoryModelStore::new());
        let tracker = Arc::new(InMemoryTracker::new());
        let failing = HyperparameterSearch::new(
            ParamGrid::default().with("fail", vec![ParamValue::Int(1)]),
            3,
            Scoring::NegMeanSquaredError,
        );
        let pipeline = TrainingPipeline::new(
            ScaledEstimator,
            FeatureBuilder::new(1, 2).unwrap(),
            failing,
            store,
        )
        .with_tracking(tracker.clone(), tracker.clone())
        .with_notifications(notifier_expecting(1));

        let report = pipeline.run(&hourly_series(48)).await;
        assert_eq!(report.audit.outcome, AuditOutcome::Error);
        assert!(report.audit.reason.contains("Training failed"));
    }
}
