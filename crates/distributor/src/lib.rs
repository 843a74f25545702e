//! Distributor - bucket maintenance scheduling
//!
//! Keeps a database of which storage nodes hold which buckets, and
//! periodically schedules the operations that bring every bucket back to
//! its desired state
//!
//! # Features
//! - Bucket database fed by out-of-order, duplicated node reports
//! - Per-bucket priority generation (merge, copy, split, join, delete, gc)
//! - Ranked dispatch onto a sequenced executor keyed by bucket
//! - Node state tracking and diagnostics HTTP API
//!
//! # Usage Example
//! ```ignore
//! use distributor::{Distributor, DistributorConfig, LoggingOperationHandler};
//!
//! let distributor = Distributor::new(DistributorConfig::default(), Arc::new(LoggingOperationHandler))?;
//! let handles = distributor.start();
//! distributor.report_bucket_info(node, bucket, info, disk, seq)?;
//! ```

pub mod api;
pub mod bucketdb;
pub mod config;
pub mod context;
pub mod maintenance;
pub mod node_state;

pub use bucketdb::{BucketDatabase, BucketReport, ReportError, ReportSink, UpdateOutcome};
pub use config::{ConfigError, DistributorConfig};
pub use context::DistributorContext;
pub use maintenance::{
    LoggingOperationHandler, MaintenanceOperation, MaintenanceOperationHandler, PassReport,
    Scheduler,
};
pub use node_state::{NodeState, NodeStates};

use std::sync::Arc;

use bucket_core::{BucketId, BucketInfo, DiskIndex, NodeIndex, Replica};
use parking_lot::Mutex;
use sequenced::{ExecutorObserver, LaneExecutor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Distributor instance
///
/// Owns every component and threads the shared context through their
/// constructors; nothing here is process-global.
pub struct Distributor {
    ctx: DistributorContext,
    nodes: Arc<NodeStates>,
    db: Arc<BucketDatabase>,
    executor: Arc<ExecutorObserver>,
    scheduler: Arc<Scheduler>,
    reports: ReportSink,
    report_rx: Mutex<Option<mpsc::Receiver<BucketReport>>>,
}

impl Distributor {
    /// Create a distributor; must be called within a tokio runtime
    pub fn new(
        config: DistributorConfig,
        handler: Arc<dyn MaintenanceOperationHandler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ctx = DistributorContext::new(config);
        let _enter = ctx.span("init").entered();

        let nodes = Arc::new(NodeStates::new(ctx.config.cluster.node_count));
        let db = Arc::new(BucketDatabase::new(ctx.clone(), nodes.clone()));
        let executor = Arc::new(ExecutorObserver::new(Arc::new(LaneExecutor::new(
            ctx.config.executor.lanes,
        ))));
        let scheduler = Arc::new(Scheduler::new(
            ctx.clone(),
            db.clone(),
            nodes.clone(),
            executor.clone(),
            handler,
        ));
        let (reports, report_rx) = bucketdb::report_channel(bucketdb::REPORT_CHANNEL_CAPACITY);

        info!(
            "Distributor initialized: nodes={}, redundancy={}, lanes={}",
            ctx.config.cluster.node_count, ctx.config.cluster.redundancy, ctx.config.executor.lanes
        );

        Ok(Self {
            ctx,
            nodes,
            db,
            executor,
            scheduler,
            reports,
            report_rx: Mutex::new(Some(report_rx)),
        })
    }

    pub fn context(&self) -> &DistributorContext {
        &self.ctx
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.ctx.config
    }

    pub fn database(&self) -> &Arc<BucketDatabase> {
        &self.db
    }

    pub fn node_states(&self) -> &Arc<NodeStates> {
        &self.nodes
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<ExecutorObserver> {
        &self.executor
    }

    /// Channel for reports applied by the background applier
    pub fn report_sink(&self) -> ReportSink {
        self.reports.clone()
    }

    /// Apply one node's bucket report directly
    pub fn report_bucket_info(
        &self,
        node: NodeIndex,
        bucket: BucketId,
        info: BucketInfo,
        disk: DiskIndex,
        report_seq: u64,
    ) -> Result<UpdateOutcome, ReportError> {
        self.db
            .update(&BucketReport::new(node, bucket, info, disk, report_seq))
    }

    /// Apply one node's report that it no longer holds a bucket
    pub fn report_bucket_removed(
        &self,
        node: NodeIndex,
        bucket: BucketId,
        report_seq: u64,
    ) -> Option<Replica> {
        self.db.remove_replica(&bucket, node, report_seq)
    }

    /// Change a node's state
    ///
    /// A node going down loses its replicas; the next pass sees the
    /// resulting redundancy deficits. Returns the number of replicas
    /// dropped.
    pub fn set_node_state(&self, node: NodeIndex, state: NodeState) -> usize {
        let previous = self.nodes.set(node, state);
        if state != NodeState::Down || previous == Some(NodeState::Down) {
            return 0;
        }
        let removed = self.db.remove_node(node);
        info!(node, removed, "Dropped replicas of down node");
        self.scheduler.trigger();
        removed
    }

    /// Run one maintenance pass now
    pub async fn run_pass(&self) -> PassReport {
        self.scheduler.run_pass().await
    }

    /// Start the report applier and the periodic scheduler
    ///
    /// The applier starts only on the first call.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(rx) = self.report_rx.lock().take() {
            handles.push(bucketdb::spawn_report_applier(
                self.db.clone(),
                rx,
                self.ctx.span("reports"),
            ));
        }
        handles.push(self.scheduler.start());
        handles
    }

    /// Stop scheduling and wait for dispatched operations
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.scheduler.drain().await;
        info!("Distributor stopped");
    }
}
