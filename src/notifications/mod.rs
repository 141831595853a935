use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::ml::gate::{AuditOutcome, AuditRecord};

pub mod telegram;

pub use telegram::TelegramNotifier;

/// Notification severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// What a pipeline run ended with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AlertType {
    ModelPromoted {
        version: String,
        candidate_rmse: f64,
        champion_rmse: Option<f64>,
    },
    ModelRejected {
        candidate_rmse: f64,
        champion_rmse: f64,
    },
    PipelineFailed {
        message: String,
    },
}

impl AlertType {
    /// Map a run's audit record to the alert sent for it
    pub fn from_audit(record: &AuditRecord) -> Self {
        match record.outcome {
            AuditOutcome::Promoted => AlertType::ModelPromoted {
                version: record
                    .promoted_version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                candidate_rmse: record.candidate_rmse.unwrap_or(f64::NAN),
                champion_rmse: record.champion_rmse,
            },
            AuditOutcome::Rejected => AlertType::ModelRejected {
                candidate_rmse: record.candidate_rmse.unwrap_or(f64::NAN),
                champion_rmse: record.champion_rmse.unwrap_or(f64::NAN),
            },
            AuditOutcome::Error => AlertType::PipelineFailed {
                message: record.reason.clone(),
            },
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            AlertType::ModelPromoted { .. } => Severity::Info,
            AlertType::ModelRejected { .. } => Severity::Warning,
            AlertType::PipelineFailed { .. } => Severity::Critical,
        }
    }

    pub fn title(&self) -> String {
        match self {
            AlertType::ModelPromoted { version, .. } => format!("Model Promoted: v{}", version),
            AlertType::ModelRejected { .. } => "Candidate Rejected".to_string(),
            AlertType::PipelineFailed { .. } => "Training Pipeline Failed".to_string(),
        }
    }

    /// Plain-text body, one fact per line
    pub fn body(&self) -> String {
        match self {
            AlertType::ModelPromoted {
                candidate_rmse,
                champion_rmse: Some(champion),
                ..
            } => format!("Candidate RMSE: {:.4}\nPrevious champion RMSE: {:.4}", candidate_rmse, champion),
            AlertType::ModelPromoted { candidate_rmse, .. } => {
                format!("Candidate RMSE: {:.4}\nNo usable previous champion", candidate_rmse)
            }
            AlertType::ModelRejected {
                candidate_rmse,
                champion_rmse,
            } => format!("Candidate RMSE: {:.4}\nChampion RMSE: {:.4}", candidate_rmse, champion_rmse),
            AlertType::PipelineFailed { message } => message.clone(),
        }
    }
}

/// A notification/alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub alert_type: AlertType,
}

impl Notification {
    pub fn new(alert_type: AlertType) -> Self {
        let severity = alert_type.default_severity();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            severity,
            alert_type,
        }
    }

    pub fn message(&self) -> String {
        format!("{}\n{}", self.alert_type.title(), self.alert_type.body())
    }
}

/// Delivers a plain-text message somewhere a human will see it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: String) -> Result<()>;
}

/// Writes messages to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: String) -> Result<()> {
        info!("Notification: {}", message.replace('\n', " | "));
        Ok(())
    }
}

/// Notification manager
pub struct NotificationManager {
    notifier: Arc<dyn Notifier>,
    notifications: RwLock<Vec<Notification>>,
    max_notifications: usize,
}

impl NotificationManager {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            notifications: RwLock::new(Vec::new()),
            max_notifications: 100,
        }
    }

    /// Send a notification. Delivery failures are logged, never returned.
    pub async fn notify(&self, alert_type: AlertType) -> Notification {
        let notification = Notification::new(alert_type);

        let title = notification.alert_type.title();
        match notification.severity {
            Severity::Critical => error!("{}", title),
            Severity::Warning => warn!("{}", title),
            Severity::Info => info!("{}", title),
        }

        if let Err(e) = self.notifier.send(notification.message()).await {
            error!("Failed to deliver notification: {}", e);
        }

        let mut notifications = self.notifications.write().await;
        notifications.insert(0, notification.clone());
        if notifications.len() > self.max_notifications {
            notifications.truncate(self.max_notifications);
        }

        notification
    }

    /// Get recent notifications
    pub async fn get_recent(&self, limit: usize) -> Vec<Notification> {
        let notifications = self.notifications.read().await;
        notifications.iter().take(limit).cloned().collect()
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new(Arc::new(LogNotifier))
    }
}
