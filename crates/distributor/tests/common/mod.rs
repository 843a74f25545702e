#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bucket_core::{BucketId, BucketInfo, DiskIndex, NodeIndex};
use distributor::{Distributor, DistributorConfig, MaintenanceOperation, MaintenanceOperationHandler};
use parking_lot::Mutex;

/// Records every operation that reaches the handler
#[derive(Default)]
pub struct RecordingHandler {
    executed: Mutex<Vec<MaintenanceOperation>>,
    fail: bool,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn executed(&self) -> Vec<MaintenanceOperation> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl MaintenanceOperationHandler for RecordingHandler {
    async fn execute(&self, operation: &MaintenanceOperation) -> anyhow::Result<()> {
        self.executed.lock().push(operation.clone());
        if self.fail {
            anyhow::bail!("storage node refused {}", operation.op);
        }
        Ok(())
    }
}

/// Six nodes, redundancy three, one lane, draining after every pass
pub fn config() -> DistributorConfig {
    let mut config = DistributorConfig::default();
    config.cluster.node_count = 6;
    config.cluster.redundancy = 3;
    config.executor.lanes = 1;
    config.maintenance.split_document_count = 500_000;
    config.maintenance.min_used_bits = 8;
    config.maintenance.drain_after_pass = true;
    config
}

pub fn setup(config: DistributorConfig) -> (Arc<Distributor>, Arc<RecordingHandler>) {
    let handler = Arc::new(RecordingHandler::default());
    let distributor = Distributor::new(config, handler.clone()).unwrap();
    (Arc::new(distributor), handler)
}

pub fn bucket(id: u64) -> BucketId {
    BucketId::new(16, id).unwrap()
}

pub fn healthy() -> BucketInfo {
    BucketInfo::new(0xc0ffee, 1000, 100_000)
}

/// Report `info` for `bucket` from each node
pub fn report_all(d: &Distributor, bucket: BucketId, nodes: &[NodeIndex], info: BucketInfo, seq: u64) {
    for node in nodes {
        d.report_bucket_info(*node, bucket, info, DiskIndex::Disk(0), seq)
            .unwrap();
    }
}
