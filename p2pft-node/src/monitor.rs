//! Transfer monitor: periodically reviews active downloads, retires completed ones and asks the
//! directory again for downloads that stopped making progress.

use std::time::Duration;

use p2pft_core::{FileItem, ProgressSample, ReviewOutcome, StallDetector, TrackerError};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::NodeError;
use crate::node::PeerNode;

/// What one monitor pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub completed: Vec<u32>,
    pub rerequested: Vec<u32>,
}

pub struct TransferMonitor {
    node: PeerNode,
    stall: StallDetector,
    interval: Duration,
}

impl TransferMonitor {
    pub fn new(node: PeerNode, config: &Config) -> Self {
        Self {
            node,
            stall: StallDetector::new(config.stall_rearm_samples),
            interval: config.monitor_interval(),
        }
    }

    /// Sample forever at the configured interval.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sample().await {
                warn!(error = %e, "monitor pass failed");
            }
        }
    }

    /// One pass over every active download.
    pub async fn sample(&mut self) -> Result<MonitorReport, NodeError> {
        let mut report = MonitorReport::default();
        let downloads = self.node.downloads().await;
        if downloads.is_empty() {
            return Ok(report);
        }
        let tracker = self.node.tracker().clone();
        let reviewed: Vec<(FileItem, Result<ReviewOutcome, TrackerError>)> =
            tokio::task::spawn_blocking(move || {
                downloads
                    .into_iter()
                    .map(|mut item| {
                        let outcome = tracker.review(&mut item);
                        (item, outcome)
                    })
                    .collect()
            })
            .await?;

        for (item, outcome) in reviewed {
            match outcome {
                Ok(ReviewOutcome::Complete(_)) => {
                    let file_id = item.file_id;
                    self.complete(item).await;
                    report.completed.push(file_id);
                }
                Ok(ReviewOutcome::Missing(ranges)) => {
                    self.node.record_missing(item.file_id, &ranges).await;
                    let Some(sample) = ProgressSample::from_ranges(&ranges) else {
                        continue;
                    };
                    if self.stall.observe(item.file_id, sample) {
                        info!(
                            file_id = item.file_id,
                            file = %item.name,
                            first_missing = sample.first_missing,
                            missing = sample.missing_chunks,
                            "download stalled, asking the directory again"
                        );
                        match self.node.request_file(item.file_id).await {
                            Ok(()) => report.rerequested.push(item.file_id),
                            Err(e) => warn!(file_id = item.file_id, error = %e, "re-request not sent"),
                        }
                    }
                }
                Err(e) => warn!(file_id = item.file_id, error = %e, "download not reviewed"),
            }
        }
        Ok(report)
    }

    async fn complete(&mut self, item: FileItem) {
        let file_id = item.file_id;
        self.stall.forget(file_id);
        self.node.finish_download(item.clone()).await;
        if let Err(e) = self.node.announce_files(&[item]).await {
            warn!(file_id, error = %e, "completed file not announced");
        }
        self.node.queue_close_by_name(&file_id.to_string()).await;
    }
}
