use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::types::RawObservation;

/// Yields the raw price series a training run starts from
#[async_trait]
pub trait ObservationSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RawObservation>>;
}

/// Reads observations from a CSV file with a header row
#[derive(Debug, Clone)]
pub struct CsvObservationSource {
    path: PathBuf,
    timestamp_column: String,
    price_column: String,
}

impl CsvObservationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timestamp_column: "Datetime".to_string(),
            price_column: "Close".to_string(),
        }
    }

    pub fn with_columns(mut self, timestamp_column: &str, price_column: &str) -> Self {
        self.timestamp_column = timestamp_column.to_string();
        self.price_column = price_column.to_string();
        self
    }

    fn read(&self) -> Result<Vec<RawObservation>> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open CSV '{}'", self.path.display()))?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(BufReader::new(file));

        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| anyhow!("Column '{}' not found in {}", name, self.path.display()))
        };
        let ts_idx = column(&self.timestamp_column)?;
        let price_idx = column(&self.price_column)?;

        let mut rows = Vec::new();
        let mut skipped = 0usize;
        for result in reader.records() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    skipped += 1;
                    warn!("Skipping malformed CSV row: {}", e);
                    continue;
                }
            };
            let field = |idx: usize| {
                record
                    .get(idx)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string())
            };
            rows.push(RawObservation {
                timestamp: field(ts_idx),
                price: field(price_idx),
            });
        }

        info!(
            "Read {} rows from {} ({} malformed)",
            rows.len(),
            self.path.display(),
            skipped
        );
        Ok(rows)
    }
}

#[async_trait]
impl ObservationSource for CsvObservationSource {
    async fn fetch(&self) -> Result<Vec<RawObservation>> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.read()).await?
    }
}
