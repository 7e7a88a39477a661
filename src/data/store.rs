//! Shared, read-only record set with wholesale reload

use crate::data::{load_records, DataSource, LoadReport};
use crate::models::RecordSet;
use crate::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Holds the current record set. Readers get an `Arc` snapshot; a reload
/// swaps in a new set and never mutates the old one.
#[derive(Clone)]
pub struct RecordStore {
    source: Option<Arc<DataSource>>,
    current: Arc<RwLock<Arc<RecordSet>>>,
    last_report: Arc<RwLock<LoadReport>>,
}

impl RecordStore {
    /// Store backed by a reloadable source, initially empty
    pub fn new(source: DataSource) -> Self {
        Self {
            source: Some(Arc::new(source)),
            current: Arc::new(RwLock::new(Arc::new(RecordSet::default()))),
            last_report: Arc::new(RwLock::new(LoadReport::default())),
        }
    }

    /// Store with fixed contents and no source
    pub fn from_records(records: RecordSet) -> Self {
        Self {
            source: None,
            current: Arc::new(RwLock::new(Arc::new(records))),
            last_report: Arc::new(RwLock::new(LoadReport::default())),
        }
    }

    pub fn source(&self) -> Option<&DataSource> {
        self.source.as_deref()
    }

    pub async fn snapshot(&self) -> Arc<RecordSet> {
        self.current.read().await.clone()
    }

    pub async fn last_report(&self) -> LoadReport {
        self.last_report.read().await.clone()
    }

    /// Replace the current set wholesale
    pub async fn replace(&self, records: RecordSet) {
        *self.current.write().await = Arc::new(records);
    }

    /// Re-run the load and swap the result in. On failure the previous set
    /// stays in place.
    pub async fn reload(&self) -> Result<LoadReport> {
        let Some(source) = &self.source else {
            info!("Record store has no source; reload skipped");
            return Ok(self.last_report().await);
        };

        let outcome = load_records(source).await.map_err(|e| {
            warn!("Record reload failed, keeping previous records: {}", e);
            e
        })?;

        self.replace(outcome.records).await;
        *self.last_report.write().await = outcome.report.clone();

        Ok(outcome.report)
    }
}
