//! Bucket info reports from storage nodes
//!
//! Reports arrive either by direct call or through a [`ReportSink`], whose
//! receiving end is drained by a single applier task.

use std::sync::Arc;

use bucket_core::{BucketId, BucketInfo, DiskIndex, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument, Span};

use super::database::BucketDatabase;
use crate::node_state::NodeState;

/// Report channel capacity
pub const REPORT_CHANNEL_CAPACITY: usize = 1024;

/// One node's view of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketReport {
    pub node: NodeIndex,
    pub bucket: BucketId,
    pub info: BucketInfo,
    pub disk: DiskIndex,
    pub report_seq: u64,
    #[serde(default = "default_trusted")]
    pub trusted: bool,
}

fn default_trusted() -> bool {
    true
}

impl BucketReport {
    pub fn new(
        node: NodeIndex,
        bucket: BucketId,
        info: BucketInfo,
        disk: DiskIndex,
        report_seq: u64,
    ) -> Self {
        Self {
            node,
            bucket,
            info,
            disk,
            report_seq,
            trusted: true,
        }
    }

    /// Mark the reported info as not authoritative
    pub fn untrusted(mut self) -> Self {
        self.trusted = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("unknown node {0}")]
    UnknownNode(NodeIndex),
    #[error("node {node} is {state}")]
    NodeUnavailable { node: NodeIndex, state: NodeState },
    #[error("disk {disk} out of range on node {node} ({disks_per_node} disks)")]
    DiskOutOfRange {
        node: NodeIndex,
        disk: u8,
        disks_per_node: u8,
    },
    #[error("report channel is full")]
    ChannelFull,
    #[error("report channel is closed")]
    ChannelClosed,
}

/// Sending half of the report channel
#[derive(Debug, Clone)]
pub struct ReportSink {
    tx: mpsc::Sender<BucketReport>,
}

impl ReportSink {
    /// Queue a report, waiting for channel space
    pub async fn report(&self, report: BucketReport) -> Result<(), ReportError> {
        self.tx
            .send(report)
            .await
            .map_err(|_| ReportError::ChannelClosed)
    }

    /// Queue a report without waiting
    pub fn try_report(&self, report: BucketReport) -> Result<(), ReportError> {
        self.tx.try_send(report).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ReportError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => ReportError::ChannelClosed,
        })
    }
}

/// Create a bounded report channel
pub fn report_channel(capacity: usize) -> (ReportSink, mpsc::Receiver<BucketReport>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ReportSink { tx }, rx)
}

/// Apply queued reports to the database until every sink is dropped
pub fn spawn_report_applier(
    db: Arc<BucketDatabase>,
    mut rx: mpsc::Receiver<BucketReport>,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            debug!("Report applier started");
            let mut applied = 0u64;
            let mut rejected = 0u64;
            while let Some(report) = rx.recv().await {
                // rejections are logged by the database
                match db.update(&report) {
                    Ok(outcome) if outcome.is_applied() => applied += 1,
                    Ok(_) => {}
                    Err(_) => rejected += 1,
                }
            }
            info!(applied, rejected, "Report applier stopped");
        }
        .instrument(span),
    )
}
