use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::features::FeatureSnapshot;
use super::model::{ModelArtifact, ModelMetrics, Regressor};
use super::persistence::{ModelStore, ModelVersion};
use super::search::ValidationSet;
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    NoChampion,
    HasChampion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionDecision {
    Promoted,
    Rejected,
}

/// Outcome recorded for every pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Promoted,
    Rejected,
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            AuditOutcome::Promoted => "promoted",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Error => "error",
        }
    }
}

impl From<PromotionDecision> for AuditOutcome {
    fn from(decision: PromotionDecision) -> Self {
        match decision {
            PromotionDecision::Promoted => AuditOutcome::Promoted,
            PromotionDecision::Rejected => AuditOutcome::Rejected,
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "promoted" => Ok(AuditOutcome::Promoted),
            "rejected" => Ok(AuditOutcome::Rejected),
            "error" => Ok(AuditOutcome::Error),
            _ => Err(anyhow::anyhow!("Unknown audit outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: Uuid,
    pub outcome: AuditOutcome,
    pub candidate_metrics: Option<ModelMetrics>,
    pub champion_metrics: Option<ModelMetrics>,
    /// RMSE of each model on the shared validation set
    pub candidate_rmse: Option<f64>,
    /// `None` when there was no champion or it could not be scored
    pub champion_rmse: Option<f64>,
    pub champion_version: Option<ModelVersion>,
    pub promoted_version: Option<ModelVersion>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn error(run_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            run_id,
            outcome: AuditOutcome::Error,
            candidate_metrics: None,
            champion_metrics: None,
            candidate_rmse: None,
            champion_rmse: None,
            champion_version: None,
            promoted_version: None,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub decision: PromotionDecision,
    pub state_before: GateState,
    pub audit: AuditRecord,
}

/// How the current champion scored on the candidate's validation set
struct ChampionScore {
    rmse: f64,
    metrics: Option<ModelMetrics>,
    version: Option<ModelVersion>,
}

impl ChampionScore {
    /// A champion that cannot be loaded or scored never blocks promotion
    fn unusable(version: Option<ModelVersion>, metrics: Option<ModelMetrics>) -> Self {
        Self {
            rmse: f64::INFINITY,
            metrics,
            version,
        }
    }
}

/// Admits a candidate as champion only if it strictly beats the current one
pub struct PromotionGate<M> {
    store: Arc<dyn ModelStore<M>>,
}

impl<M> PromotionGate<M>
where
    M: Regressor + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn ModelStore<M>>) -> Self {
        Self { store }
    }

    /// A store that errors still nominally holds a champion
    pub async fn state(&self) -> GateState {
        match self.store.current_version().await {
            Ok(None) => GateState::NoChampion,
            _ => GateState::HasChampion,
        }
    }

    pub async fn evaluate(
        &self,
        run_id: Uuid,
        candidate: ModelArtifact<M>,
        snapshot: FeatureSnapshot,
        validation: &ValidationSet,
    ) -> PipelineResult<GateOutcome> {
        if validation.is_empty() {
            return Err(PipelineError::DataInsufficient {
                required: 1,
                available: 0,
                reason: "empty validation set".to_string(),
            });
        }
        let candidate_rmse = validation.rmse(&candidate.model)?;
        let candidate_metrics = candidate.metrics;

        let (state_before, champion) = match self.store.get_champion().await {
            Ok(None) => (GateState::NoChampion, None),
            Ok(Some(champion)) => (
                GateState::HasChampion,
                Some(self.score_champion(&candidate, champion, validation).await),
            ),
            Err(e) => {
                let err = PipelineError::ChampionLoad(e.to_string());
                warn!("{}; treating champion RMSE as infinite", err);
                (
                    GateState::HasChampion,
                    Some(ChampionScore::unusable(None, None)),
                )
            }
        };

        let decision = match &champion {
            None => PromotionDecision::Promoted,
            Some(score) if candidate_rmse < score.rmse => PromotionDecision::Promoted,
            Some(_) => PromotionDecision::Rejected,
        };

        let champion_rmse = champion.as_ref().map(|c| c.rmse).filter(|r| r.is_finite());
        let reason = match (&champion, decision) {
            (None, _) => "first champion".to_string(),
            (Some(c), PromotionDecision::Promoted) if !c.rmse.is_finite() => {
                "champion unusable; promoted by self-healing policy".to_string()
            }
            (Some(c), PromotionDecision::Promoted) => format!(
                "candidate RMSE {:.6} < champion RMSE {:.6}",
                candidate_rmse, c.rmse
            ),
            (Some(c), PromotionDecision::Rejected) => format!(
                "candidate RMSE {:.6} does not beat champion RMSE {:.6}",
                candidate_rmse, c.rmse
            ),
        };

        let promoted_version = match decision {
            PromotionDecision::Promoted => Some(self.store.put_champion(candidate, snapshot).await?),
            PromotionDecision::Rejected => None,
        };

        match decision {
            PromotionDecision::Promoted => info!("PROMOTED: {}", reason),
            PromotionDecision::Rejected => info!("REJECTED: {}", reason),
        }

        let (champion_metrics, champion_version) = champion
            .map(|c| (c.metrics, c.version))
            .unwrap_or((None, None));

        Ok(GateOutcome {
            decision,
            state_before,
            audit: AuditRecord {
                run_id,
                outcome: decision.into(),
                candidate_metrics: Some(candidate_metrics),
                champion_metrics,
                candidate_rmse: Some(candidate_rmse),
                champion_rmse,
                champion_version,
                promoted_version,
                reason,
                timestamp: Utc::now(),
            },
        })
    }

    async fn score_champion(
        &self,
        candidate: &ModelArtifact<M>,
        champion: ModelArtifact<M>,
        validation: &ValidationSet,
    ) -> ChampionScore {
        let version = self.store.current_version().await.ok().flatten();

        if champion.feature_cols != candidate.feature_cols {
            warn!(
                "Champion was trained on {:?}, candidate on {:?}; champion cannot be scored",
                champion.feature_cols, candidate.feature_cols
            );
            return ChampionScore::unusable(version, Some(champion.metrics));
        }

        match validation.rmse(&champion.model) {
            Ok(rmse) if rmse.is_finite() => ChampionScore {
                rmse,
                metrics: Some(champion.metrics),
                version,
            },
            Ok(rmse) => {
                warn!("Champion scored a non-finite RMSE ({}) on the validation set", rmse);
                ChampionScore::unusable(version, Some(champion.metrics))
            }
            Err(e) => {
                warn!("Champion failed to score validation set: {}", e);
                ChampionScore::unusable(version, Some(champion.metrics))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::testing::ConstantRegressor;
    use crate::ml::persistence::fixtures::{artifact, snapshot};
    use crate::ml::persistence::{FileModelStore, InMemoryModelStore};
    use ndarray::Array2;
    use tempfile::tempdir;

    /// Predicts NaN when the flag is set, 0.5 otherwise
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct NanRegressor(bool);

    impl Regressor for NanRegressor {
        fn predict(&self, x: &Array2<f64>) -> PipelineResult<Vec<f64>> {
            let value = if self.0 { f64::NAN } else { 0.5 };
            Ok(vec![value; x.nrows()])
        }
    }

    fn nan_artifact(nan: bool) -> ModelArtifact<NanRegressor> {
        ModelArtifact::new(
            "nan",
            NanRegressor(nan),
            Default::default(),
            ModelMetrics::default(),
            vec!["hour".to_string(), "lag_1".to_string()],
        )
    }

    fn zero_validation() -> ValidationSet {
        ValidationSet {
            x: Array2::zeros((4, 2)),
            y: vec![0.0; 4],
        }
    }

    fn gate() -> (Arc<InMemoryModelStore>, PromotionGate<ConstantRegressor>) {
        let store = Arc::new(InMemoryModelStore::new());
        let gate = PromotionGate::new(store.clone() as Arc<dyn ModelStore<ConstantRegressor>>);
        (store, gate)
    }

    async fn champion_value(store: &InMemoryModelStore) -> Option<f64> {
        ModelStore::<ConstantRegressor>::get_champion(store)
            .await
            .unwrap()
            .map(|a| a.model.0)
    }

    #[tokio::test]
    async fn test_first_candidate_is_always_promoted() {
        let (store, gate) = gate();
        assert_eq!(gate.state().await, GateState::NoChampion);

        // Even a terrible candidate wins against no champion
        let outcome = gate
            .evaluate(Uuid::new_v4(), artifact(1000.0, 1000.0), snapshot(1.0), &zero_validation())
            .await
            .unwrap();

        assert_eq!(outcome.decision, PromotionDecision::Promoted);
        assert_eq!(outcome.state_before, GateState::NoChampion);
        assert_eq!(outcome.audit.promoted_version, Some(ModelVersion::initial()));
        assert!(outcome.audit.champion_metrics.is_none());
        assert_eq!(gate.state().await, GateState::HasChampion);
        assert_eq!(champion_value(&store).await, Some(1000.0));
    }

    #[tokio::test]
    async fn test_worse_candidate_is_rejected_and_store_unchanged() {
        let (store, gate) = gate();
        gate.evaluate(Uuid::new_v4(), artifact(1.0, 1.0), snapshot(1.0), &zero_validation())
            .await
            .unwrap();

        let outcome = gate
            .evaluate(Uuid::new_v4(), artifact(2.0, 2.0), snapshot(2.0), &zero_validation())
            .await
            .unwrap();

        assert_eq!(outcome.decision, PromotionDecision::Rejected);
        assert_eq!(outcome.audit.outcome, AuditOutcome::Rejected);
        assert_eq!(outcome.audit.candidate_rmse, Some(2.0));
        assert_eq!(outcome.audit.champion_rmse, Some(1.0));
        assert_eq!(outcome.audit.champion_version, Some(ModelVersion::initial()));
        assert!(outcome.audit.promoted_version.is_none());

        assert_eq!(champion_value(&store).await, Some(1.0));
        assert_eq!(
            ModelStore::<ConstantRegressor>::current_version(store.as_ref()).await.unwrap(),
            Some(ModelVersion::initial())
        );
        let kept_snapshot = ModelStore::<ConstantRegressor>::get_snapshot(store.as_ref())
            .await
            .unwrap();
        assert_eq!(kept_snapshot, Some(snapshot(1.0)));
    }

    #[tokio::test]
    async fn test_tie_is_rejected() {
        let (store, gate) = gate();
        gate.evaluate(Uuid::new_v4(), artifact(1.5, 1.5), snapshot(1.0), &zero_validation())
            .await
            .unwrap();
        let outcome = gate
            .evaluate(Uuid::new_v4(), artifact(-1.5, 1.5), snapshot(2.0), &zero_validation())
            .await
            .unwrap();
        assert_eq!(outcome.decision, PromotionDecision::Rejected);
        assert_eq!(champion_value(&store).await, Some(1.5));
    }

    #[tokio::test]
    async fn test_strictly_better_candidate_is_promoted() {
        let (store, gate) = gate();
        gate.evaluate(Uuid::new_v4(), artifact(3.0, 3.0), snapshot(1.0), &zero_validation())
            .await
            .unwrap();
        let outcome = gate
            .evaluate(Uuid::new_v4(), artifact(0.5, 0.5), snapshot(2.0), &zero_validation())
            .await
            .unwrap();

        assert_eq!(outcome.decision, PromotionDecision::Promoted);
        assert_eq!(outcome.audit.promoted_version, Some(ModelVersion::new(1, 0, 1)));
        assert_eq!(champion_value(&store).await, Some(0.5));
        assert_eq!(
            ModelStore::<ConstantRegressor>::get_snapshot(store.as_ref()).await.unwrap(),
            Some(snapshot(2.0))
        );
    }

    #[tokio::test]
    async fn test_corrupted_champion_forces_promotion() {
        let (store, gate) = gate();
        gate.evaluate(Uuid::new_v4(), artifact(0.1, 0.1), snapshot(1.0), &zero_validation())
            .await
            .unwrap();
        store.corrupt().await;
        assert_eq!(gate.state().await, GateState::HasChampion);

        let outcome = gate
            .evaluate(Uuid::new_v4(), artifact(9.0, 9.0), snapshot(2.0), &zero_validation())
            .await
            .unwrap();

        assert_eq!(outcome.decision, PromotionDecision::Promoted);
        assert_eq!(outcome.state_before, GateState::HasChampion);
        assert!(outcome.audit.champion_rmse.is_none());
        assert_eq!(champion_value(&store).await, Some(9.0));
    }

    #[tokio::test]
    async fn test_champion_with_other_features_cannot_block() {
        let (store, gate) = gate();
        let mut old = artifact(0.0, 0.0);
        old.feature_cols = vec!["hour".to_string(), "lag_2".to_string()];
        store.put_champion(old, snapshot(1.0)).await.unwrap();

        let outcome = gate
            .evaluate(Uuid::new_v4(), artifact(5.0, 5.0), snapshot(2.0), &zero_validation())
            .await
            .unwrap();
        assert_eq!(outcome.decision, PromotionDecision::Promoted);
        assert!(outcome.audit.champion_metrics.is_some());
        assert_eq!(champion_value(&store).await, Some(5.0));
    }

    #[tokio::test]
    async fn test_empty_validation_set_is_an_error() {
        let (_, gate) = gate();
        let empty = ValidationSet {
            x: Array2::zeros((0, 2)),
            y: vec![],
        };
        let result = gate
            .evaluate(Uuid::new_v4(), artifact(1.0, 1.0), snapshot(1.0), &empty)
            .await;
        assert!(matches!(result, Err(PipelineError::DataInsufficient { .. })));
    }

    #[test]
    fn test_audit_outcome_strings() {
        for outcome in [AuditOutcome::Promoted, AuditOutcome::Rejected, AuditOutcome::Error] {
            assert_eq!(AuditOutcome::from_str(outcome.as_str()).unwrap(), outcome);
        }
        assert!(AuditOutcome::from_str("maybe").is_err());
    }

    #[tokio::test]
    async fn test_nan_scoring_champion_cannot_block() {
        let store = Arc::new(InMemoryModelStore::new());
        ModelStore::<NanRegressor>::put_champion(store.as_ref(), nan_artifact(true), snapshot(1.0))
            .await
            .unwrap();
        let gate = PromotionGate::new(store.clone() as Arc<dyn ModelStore<NanRegressor>>);

        let outcome = gate
            .evaluate(Uuid::new_v4(), nan_artifact(false), snapshot(2.0), &zero_validation())
            .await
            .unwrap();
        assert_eq!(outcome.decision, PromotionDecision::Promoted);
        assert!(outcome.audit.champion_rmse.is_none());
        assert_eq!(outcome.audit.candidate_rmse, Some(0.5));
        let champion = ModelStore::<NanRegressor>::get_champion(store.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(champion.model, NanRegressor(false));
    }

    #[tokio::test]
    async fn test_garbage_file_pointer_does_not_block_promotion() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ModelStore<ConstantRegressor>> = Arc::new(FileModelStore::new(dir.path()));
        let gate = PromotionGate::new(store.clone());
        gate.evaluate(Uuid::new_v4(), artifact(0.1, 0.1), snapshot(1.0), &zero_validation())
            .await
            .unwrap();
        std::fs::write(dir.path().join("CURRENT"), "garbage").unwrap();

        for (i, value) in [5.0, 4.0].into_iter().enumerate() {
            let outcome = gate
                .evaluate(Uuid::new_v4(), artifact(value, value), snapshot(2.0), &zero_validation())
                .await
                .unwrap();
            assert_eq!(outcome.decision, PromotionDecision::Promoted, "run {}", i);
        }
        assert_eq!(
            store.current_version().await.unwrap(),
            Some(ModelVersion::new(1, 0, 2))
        );
        assert_eq!(store.get_champion().await.unwrap().unwrap().model, ConstantRegressor(4.0));
    }
}
