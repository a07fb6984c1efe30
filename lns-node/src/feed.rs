//! Line-delimited JSON uplink feed.
//!
//! Each line holds one `UplinkRecord`. Every dispatched uplink gets a
//! completion task that logs its outcome; the feed returns only once all of
//! them have finished, so no outcome is lost when the input ends.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::device::DevAddr;
use crate::dispatcher::MessageDispatcher;
use crate::error::Result;
use crate::uplink::{RadioMetadata, UplinkFrame, UplinkHandle, UplinkOutcome};

/// One uplink as read from the feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkRecord {
    pub frame: UplinkFrame,
    pub radio: RadioMetadata,
}

/// Tally of a finished feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub dispatched: usize,
    pub malformed: usize,
    pub processed: usize,
    /// Dropped as duplicate or from an unknown device
    pub not_applied: usize,
    pub failed: usize,
}

impl FeedStats {
    fn record(&mut self, joined: std::result::Result<UplinkOutcome, JoinError>) {
        match joined {
            Ok(UplinkOutcome::Processed(_)) => self.processed += 1,
            Ok(UplinkOutcome::DuplicateDropped) | Ok(UplinkOutcome::NotFound) => {
                self.not_applied += 1
            }
            Ok(UplinkOutcome::TransientFailure(_)) | Ok(UplinkOutcome::Failed(_)) => {
                self.failed += 1
            }
            Err(e) => {
                warn!(error = %e, "Uplink completion task failed");
                self.failed += 1;
            }
        }
    }
}

/// Dispatch every record of `reader` until EOF and wait for all outcomes
pub async fn run_uplink_feed<R>(reader: R, dispatcher: MessageDispatcher) -> Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut completions: JoinSet<UplinkOutcome> = JoinSet::new();
    let mut stats = FeedStats::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let record: UplinkRecord = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed uplink record");
                        stats.malformed += 1;
                        continue;
                    }
                };
                // dispatched here, in input order; only the wait is spawned
                let dev_addr = record.frame.dev_addr;
                let fcnt_up = record.frame.fcnt_up;
                let handle = dispatcher.dispatch(record.frame, record.radio);
                stats.dispatched += 1;
                completions.spawn(complete(dev_addr, fcnt_up, handle));
            }
            Some(joined) = completions.join_next(), if !completions.is_empty() => {
                stats.record(joined);
            }
        }
    }

    debug!(pending = completions.len(), "Uplink feed closed, draining completions");
    while let Some(joined) = completions.join_next().await {
        stats.record(joined);
    }
    info!(
        dispatched = stats.dispatched,
        processed = stats.processed,
        malformed = stats.malformed,
        failed = stats.failed,
        "Uplink feed finished"
    );
    Ok(stats)
}

async fn complete(dev_addr: DevAddr, fcnt_up: u32, handle: UplinkHandle) -> UplinkOutcome {
    let outcome = handle.wait().await;
    match &outcome {
        UplinkOutcome::Processed(processed) => info!(
            dev_addr = %dev_addr,
            dev_eui = %processed.dev_eui,
            fcnt_up,
            fcnt_down = ?processed.fcnt_down,
            marked_duplicate = processed.marked_duplicate,
            "Uplink processed"
        ),
        UplinkOutcome::TransientFailure(reason) | UplinkOutcome::Failed(reason) => {
            warn!(dev_addr = %dev_addr, fcnt_up, reason = %reason, "Uplink failed")
        }
        other => debug!(dev_addr = %dev_addr, fcnt_up, outcome = other.label(), "Uplink not applied"),
    }
    outcome
}
