//! Per-process progress reporting.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::HarvestError;
use crate::models::{DataReference, PublishingStatus};
use crate::process::{ProcessInfo, ProcessListener, ProcessStatus};

/// Creates the reporting listener attached to every started process.
pub trait ReportManager: Send + Sync {
    fn create_listener(&self, process: &ProcessInfo) -> Arc<dyn ProcessListener>;
}

/// Reports progress through `tracing`.
#[derive(Debug, Default)]
pub struct LogReportManager;

impl ReportManager for LogReportManager {
    fn create_listener(&self, _process: &ProcessInfo) -> Arc<dyn ProcessListener> {
        Arc::new(LogReport::default())
    }
}

/// Counters of one run, without any logging.
#[derive(Debug, Default)]
pub struct ReportCounters {
    acquired: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
}

impl ReportCounters {
    pub fn summary(&self) -> String {
        format!(
            "Acquired: {}, published: {}, failed: {}",
            self.acquired.load(Ordering::Relaxed),
            self.published.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed)
        )
    }

    fn acquired(&self) -> u64 {
        self.acquired.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a processed record; returns the published count when the
    /// record was created or updated somewhere.
    fn processed(&self, status: PublishingStatus) -> Option<u64> {
        (status.created + status.updated > 0)
            .then(|| self.published.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl ProcessListener for ReportCounters {
    async fn on_data_acquired(&self, _process: &ProcessInfo, _data: &DataReference) {
        self.acquired();
    }

    async fn on_data_processed(
        &self,
        _process: &ProcessInfo,
        _data: &DataReference,
        status: PublishingStatus,
    ) {
        self.processed(status);
    }

    async fn on_error(&self, _process: &ProcessInfo, _err: &HarvestError) {
        self.failed();
    }
}

/// Counters of one run, logged as they change.
#[derive(Debug, Default)]
pub struct LogReport {
    counters: ReportCounters,
}

impl LogReport {
    pub fn summary(&self) -> String {
        self.counters.summary()
    }
}

#[async_trait]
impl ProcessListener for LogReport {
    async fn on_status_change(&self, process: &ProcessInfo, status: ProcessStatus) {
        match status {
            ProcessStatus::Working => info!(title = %process.title, "Started"),
            ProcessStatus::Aborting => info!(title = %process.title, "Aborting"),
            ProcessStatus::Completed => {
                info!(title = %process.title, summary = %self.summary(), "Completed")
            }
            ProcessStatus::Submitted => {}
        }
    }

    async fn on_data_acquired(&self, _process: &ProcessInfo, data: &DataReference) {
        let n = self.counters.acquired();
        debug!(n, record = %data, "Acquired");
    }

    async fn on_data_processed(
        &self,
        _process: &ProcessInfo,
        data: &DataReference,
        status: PublishingStatus,
    ) {
        if let Some(n) = self.counters.processed(status) {
            debug!(n, record = %data, "Published");
        }
    }

    async fn on_error(&self, process: &ProcessInfo, err: &HarvestError) {
        self.counters.failed();
        warn!(title = %process.title, error = %err, "Error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;
    use uuid::Uuid;

    #[tokio::test]
    async fn summary_counts_published_records_only() {
        let report = LogReport::default();
        let info = ProcessInfo {
            id: Uuid::new_v4(),
            task_id: None,
            title: "t".into(),
        };
        let data = DataReference::new("a", Url::parse("http://h/a").unwrap(), "X:y", vec![]);
        report.on_data_acquired(&info, &data).await;
        report.on_data_acquired(&info, &data).await;
        report
            .on_data_processed(&info, &data, PublishingStatus::CREATED)
            .await;
        report
            .on_data_processed(&info, &data, PublishingStatus::EMPTY)
            .await;
        report
            .on_error(&info, &HarvestError::input("X:y", "boom"))
            .await;
        assert_eq!(report.summary(), "Acquired: 2, published: 1, failed: 1");
    }

    #[tokio::test]
    async fn skipped_records_are_not_published() {
        let counters = ReportCounters::default();
        let info = ProcessInfo {
            id: Uuid::new_v4(),
            task_id: None,
            title: "t".into(),
        };
        let data = DataReference::new("a", Url::parse("http://h/a").unwrap(), "X:y", vec![]);
        counters
            .on_data_processed(&info, &data, PublishingStatus::SKIPPED)
            .await;
        counters
            .on_data_processed(&info, &data, PublishingStatus::UPDATED)
            .await;
        assert_eq!(counters.summary(), "Acquired: 0, published: 1, failed: 0");
    }
}
