//! Plain pull-and-publish loop over one input broker and a flat list of
//! output brokers, run on the caller's task.
//!
//! This is the minimal pipeline: no filters, no transformers, no abort.
//! [`crate::process::Process`] is the full-featured equivalent.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{PublishingStatus, TaskDefinition};
use crate::process::{ProcessInfo, ProcessListener, ProcessStatus};
use crate::traits::{InitContext, InputBroker, IteratorContext, OutputBroker};

/// Totals of one [`DataCollector::collect`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectSummary {
    pub acquired: u64,
    pub failed: u64,
    pub status: PublishingStatus,
}

pub struct DataCollector {
    source: Box<dyn InputBroker>,
    destinations: Vec<Box<dyn OutputBroker>>,
    listeners: Vec<Arc<dyn ProcessListener>>,
}

impl DataCollector {
    pub fn new(source: Box<dyn InputBroker>, destinations: Vec<Box<dyn OutputBroker>>) -> Self {
        Self {
            source,
            destinations,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ProcessListener>) {
        self.listeners.push(listener);
    }

    fn title(&self) -> String {
        let destinations = self
            .destinations
            .iter()
            .map(|d| d.entity_definition().to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("{} --> [{}]", self.source.broker_uri(), destinations)
    }

    /// Harvest every record of the source into every destination. Input
    /// errors end the run; output errors are reported and the run goes on.
    pub async fn collect(&mut self, iter_ctx: &IteratorContext) -> Result<CollectSummary> {
        let info = ProcessInfo {
            id: Uuid::new_v4(),
            task_id: None,
            title: self.title(),
        };
        let mut task = TaskDefinition::new(self.source.entity_definition().clone());
        task.incremental = iter_ctx.last_harvest.is_some();
        let ctx = InitContext::new(task, None, self.source.broker_uri());
        for l in &self.listeners {
            ctx.add_listener(Arc::clone(l));
        }

        for l in &self.listeners {
            l.on_status_change(&info, ProcessStatus::Working).await;
        }
        info!(title = %info.title, "Started collecting");

        let result = self.run(&info, &ctx, iter_ctx).await;
        if let Err(e) = &result {
            for l in ctx.listeners() {
                l.on_error(&info, e).await;
            }
        }

        if let Err(e) = self.source.terminate().await {
            tracing::warn!(error = %e, "error terminating input broker");
        }
        for d in &mut self.destinations {
            if let Err(e) = d.terminate().await {
                tracing::warn!(error = %e, "error terminating output broker");
            }
        }

        for l in ctx.listeners() {
            l.on_status_change(&info, ProcessStatus::Completed).await;
        }
        info!(title = %info.title, "Completed collecting");
        result
    }

    async fn run(
        &mut self,
        info: &ProcessInfo,
        ctx: &InitContext,
        iter_ctx: &IteratorContext,
    ) -> Result<CollectSummary> {
        self.source.initialize(ctx).await?;
        for d in &mut self.destinations {
            d.initialize(ctx).await?;
        }

        let mut summary = CollectSummary::default();
        let mut iter = self.source.iterator(iter_ctx).await?;
        while iter.has_next().await? {
            let data = iter.next().await?;
            summary.acquired += 1;
            for l in ctx.listeners() {
                l.on_data_acquired(info, &data).await;
            }
            for d in &mut self.destinations {
                match d.publish(&data).await {
                    Ok(status) => {
                        debug!(record = %data, "harvested");
                        summary.status = summary.status.collect(status);
                        for l in ctx.listeners() {
                            l.on_data_processed(info, &data, status).await;
                        }
                    }
                    Err(e) => {
                        debug!(record = %data, error = %e, "failed harvesting");
                        summary.failed += 1;
                        for l in ctx.listeners() {
                            l.on_error(info, &e).await;
                        }
                    }
                }
            }
        }
        Ok(summary)
    }
}
