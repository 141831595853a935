use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ml::gate::{AuditOutcome, AuditRecord};
use crate::ml::model::ParamSet;
use crate::ml::tracker::{AuditLog, DiagnosticSeries, ExperimentTracker, RunRecord};

/// SQLite-backed experiment tracker and audit log.
///
/// Diagnostic series are written as CSV files under
/// `<artifacts_dir>/<run_id>/<name>.csv`; the run row keeps their paths.
pub struct SqliteTracker {
    pool: SqlitePool,
    artifacts_dir: PathBuf,
}

impl SqliteTracker {
    /// Connect to a database URL such as `sqlite://pricecast.db`
    pub async fn new(db_url: &str, artifacts_dir: impl Into<PathBuf>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        Self::connect(options, artifacts_dir.into()).await
    }

    pub async fn open(path: impl AsRef<Path>, artifacts_dir: impl Into<PathBuf>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect(options, artifacts_dir.into()).await
    }

    async fn connect(options: SqliteConnectOptions, artifacts_dir: PathBuf) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let tracker = Self { pool, artifacts_dir };
        tracker.create_schema().await?;

        info!("Experiment tracker initialized");
        Ok(tracker)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                experiment TEXT NOT NULL,
                created_at TEXT NOT NULL,
                params TEXT NOT NULL,
                metrics TEXT NOT NULL,
                artifacts TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_runs_experiment ON runs(experiment, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                outcome TEXT NOT NULL,
                reason TEXT NOT NULL,
                record TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_audit_outcome ON audit_records(outcome)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn write_artifact(&self, run_id: Uuid, series: &DiagnosticSeries) -> Result<PathBuf> {
        let dir = self.artifacts_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["actual", "predicted"])?;
        for (actual, predicted) in series.actual.iter().zip(&series.predicted) {
            writer.write_record([actual.to_string(), predicted.to_string()])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing {}: {}", series.name, e.error()))?;

        let path = dir.join(format!("{}.csv", series.name));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl ExperimentTracker for SqliteTracker {
    async fn log_run(
        &self,
        experiment: String,
        params: ParamSet,
        metrics: BTreeMap<String, f64>,
        artifacts: Vec<DiagnosticSeries>,
    ) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        let mut paths = Vec::with_capacity(artifacts.len());
        for series in &artifacts {
            paths.push(self.write_artifact(run_id, series).await?);
        }

        sqlx::query(
            r#"
            INSERT INTO runs (id, experiment, created_at, params, metrics, artifacts)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(&experiment)
        .bind(timestamp(&Utc::now()))
        .bind(serde_json::to_string(&params)?)
        .bind(serde_json::to_string(&metrics)?)
        .bind(serde_json::to_string(&paths)?)
        .execute(&self.pool)
        .await?;

        debug!("Logged run {} ({} artifacts)", run_id, paths.len());
        Ok(run_id)
    }

    async fn fetch_latest_run(&self, experiment: String) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, experiment, created_at, params, metrics, artifacts
            FROM runs
            WHERE experiment = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(&experiment)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.get("id");
        let created_at: String = row.get("created_at");
        let params: String = row.get("params");
        let metrics: String = row.get("metrics");
        let artifacts: String = row.get("artifacts");

        Ok(Some(RunRecord {
            run_id: Uuid::parse_str(&id)?,
            experiment: row.get("experiment"),
            params: serde_json::from_str(&params)?,
            metrics: serde_json::from_str(&metrics)?,
            artifacts: serde_json::from_str(&artifacts)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        }))
    }
}

#[async_trait]
impl AuditLog for SqliteTracker {
    async fn record_audit(&self, record: AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_records (run_id, timestamp, outcome, reason, record)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(timestamp(&record.timestamp))
        .bind(record.outcome.as_str())
        .bind(&record.reason)
        .bind(serde_json::to_string(&record)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_audits(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT outcome, record
            FROM audit_records
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("record");
            let record: AuditRecord = serde_json::from_str(&json)?;
            // The outcome column is what operators filter on; keep it authoritative
            let outcome = AuditOutcome::from_str(row.get("outcome"))?;
            records.push(AuditRecord { outcome, ..record });
        }

        Ok(records)
    }
}
