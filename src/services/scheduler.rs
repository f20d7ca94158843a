//! In-process resume loop for scheduled imports
//!
//! Optional companion to the `run-scheduled` CLI command: both call
//! `ImportService::run_scheduled`, so a job is resumed the same way whether
//! cron or this loop picks it up.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::import_service::ImportService;
use crate::defaults::DEFAULT_SCHEDULED_BATCH;

pub struct ImportScheduler {
    service: Arc<ImportService>,
    interval: Duration,
    batch: usize,
}

impl ImportScheduler {
    pub fn new(service: Arc<ImportService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            batch: DEFAULT_SCHEDULED_BATCH,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// One pass; errors are logged, never returned
    pub async fn tick(&self) {
        if let Err(e) = self.service.run_scheduled(self.batch).await {
            error!(error = %e, "Scheduled import pass failed");
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        info!(interval = ?self.interval, batch = self.batch, "Import scheduler started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}
