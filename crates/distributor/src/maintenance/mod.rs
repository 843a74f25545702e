//! Maintenance scheduling
//!
//! A pass resets node load, snapshots the bucket database, asks the
//! priority generator about every bucket, ranks the results and dispatches
//! one operation per bucket to the sequenced executor, keyed by bucket.

mod operation;
mod pending;
mod placement;
mod priority;
mod stats;

pub use operation::{LoggingOperationHandler, MaintenanceOperation, MaintenanceOperationHandler};
pub use pending::{PendingGuard, PendingOperation, PendingOperations};
pub use placement::PlacementStrategy;
pub use priority::{
    MaintenanceOperationType, MaintenancePriority, MaintenancePriorityAndType, PriorityGenerator,
};
pub use stats::{
    MaintenanceKind, NodeLoad, NodeMaintenanceStats, NodeMaintenanceStatsTracker,
    NodeStatsSnapshot,
};

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bucket_core::{BucketId, NodeIndex, ReplicaSet};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sequenced::{task, SequencedExecutor};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::bucketdb::{BucketDatabase, BucketSnapshot};
use crate::context::DistributorContext;
use crate::node_state::NodeStates;

/// One dispatched operation as recorded in a [`PassReport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchRecord {
    pub bucket: BucketId,
    pub op: MaintenanceOperationType,
    pub priority: MaintenancePriority,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub buckets_scanned: usize,
    /// Dispatch order: priority descending, then bucket ascending
    pub dispatched: Vec<DispatchRecord>,
    pub by_type: BTreeMap<MaintenanceOperationType, usize>,
    /// Buckets whose previous operation had not finished yet
    pub skipped_pending: usize,
    /// Copies with no node to copy to
    pub unplaceable: usize,
    pub failed_submits: usize,
    pub drained: bool,
}

impl PassReport {
    fn new(pass: u64) -> Self {
        let now = Utc::now();
        Self {
            pass,
            started_at: now,
            finished_at: now,
            buckets_scanned: 0,
            dispatched: Vec::new(),
            by_type: BTreeMap::new(),
            skipped_pending: 0,
            unplaceable: 0,
            failed_submits: 0,
            drained: false,
        }
    }

    fn record(&mut self, operation: &MaintenanceOperation) {
        self.dispatched.push(DispatchRecord {
            bucket: operation.bucket,
            op: operation.op,
            priority: operation.priority,
        });
        *self.by_type.entry(operation.op).or_default() += 1;
    }
}

/// Maintenance scheduler
pub struct Scheduler {
    ctx: DistributorContext,
    db: Arc<BucketDatabase>,
    nodes: Arc<NodeStates>,
    stats: Arc<NodeMaintenanceStatsTracker>,
    executor: Arc<dyn SequencedExecutor>,
    handler: Arc<dyn MaintenanceOperationHandler>,
    generator: PriorityGenerator,
    placement: PlacementStrategy,
    pending: Arc<PendingOperations>,
    /// One pass at a time
    pass_lock: Mutex<()>,
    pass_count: AtomicU64,
    trigger: Notify,
    stopped: AtomicBool,
    last_pass: RwLock<Option<PassReport>>,
}

impl Scheduler {
    pub fn new(
        ctx: DistributorContext,
        db: Arc<BucketDatabase>,
        nodes: Arc<NodeStates>,
        executor: Arc<dyn SequencedExecutor>,
        handler: Arc<dyn MaintenanceOperationHandler>,
    ) -> Self {
        let generator = PriorityGenerator::new(
            ctx.config.cluster.redundancy,
            ctx.config.maintenance.clone(),
        );
        Self {
            ctx,
            db,
            nodes,
            stats: Arc::new(NodeMaintenanceStatsTracker::new()),
            executor,
            handler,
            generator,
            placement: PlacementStrategy::default(),
            pending: Arc::new(PendingOperations::new()),
            pass_lock: Mutex::new(()),
            pass_count: AtomicU64::new(0),
            trigger: Notify::new(),
            stopped: AtomicBool::new(false),
            last_pass: RwLock::new(None),
        }
    }

    /// Run one maintenance pass
    ///
    /// Concurrent callers wait for the running pass to finish first.
    pub async fn run_pass(&self) -> PassReport {
        let _pass = self.pass_lock.lock().await;
        let mut report = PassReport::new(self.pass_count.fetch_add(1, Ordering::Relaxed) + 1);

        // Load still held by unfinished operations from earlier passes
        self.stats.reset();
        self.pending.replay_load(&self.stats);

        let snapshot = self.db.snapshot(self.ctx.config.distributor.region);
        let candidates = self.nodes.copy_targets();

        let mut planned = Vec::new();
        let mut planned_keys = HashSet::new();
        for (bucket, replicas) in snapshot.iter() {
            report.buckets_scanned += 1;

            let decision = self.generator.prioritize(bucket, &snapshot, self.stats.as_ref());
            trace!(bucket = %bucket, "{} at {}", decision.op, decision.priority);
            if decision.is_none() {
                continue;
            }

            let operation = self.build_operation(*bucket, replicas, decision, &snapshot, &candidates);
            // Operations sharing a bucket must run in order on one lane;
            // work keyed differently waits until the other has finished
            let conflicts = operation.conflict_keys();
            if conflicts.iter().any(|key| self.pending.is_pending(*key)) {
                report.skipped_pending += 1;
                continue;
            }
            if conflicts.iter().any(|key| planned_keys.contains(key)) {
                debug!(bucket = %bucket, op = %operation.op, "Bucket already has work this pass");
                continue;
            }
            if operation.op == MaintenanceOperationType::CopyBucket && operation.targets.is_empty() {
                debug!(bucket = %bucket, "No copy target available");
                report.unplaceable += 1;
                continue;
            }
            planned_keys.insert(operation.sequencing_key());

            // Later buckets in this pass see this operation's load
            for (node, kind) in operation.load() {
                self.stats.increment(node, kind);
            }
            planned.push(operation);
        }

        planned.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.bucket.cmp(&b.bucket))
        });

        for operation in planned {
            self.dispatch(operation, &mut report);
        }

        if self.ctx.config.maintenance.drain_after_pass {
            self.executor.drain().await;
            report.drained = true;
        }

        report.finished_at = Utc::now();
        info!(
            pass = report.pass,
            scanned = report.buckets_scanned,
            dispatched = report.dispatched.len(),
            skipped_pending = report.skipped_pending,
            "Maintenance pass completed"
        );
        *self.last_pass.write() = Some(report.clone());
        report
    }

    fn build_operation(
        &self,
        bucket: BucketId,
        replicas: &ReplicaSet,
        decision: MaintenancePriorityAndType,
        snapshot: &BucketSnapshot,
        candidates: &[NodeIndex],
    ) -> MaintenanceOperation {
        let operation =
            MaintenanceOperation::new(bucket, decision.op, decision.priority, replicas.clone());
        match decision.op {
            MaintenanceOperationType::CopyBucket => {
                let missing = (self.ctx.config.cluster.redundancy as usize)
                    .saturating_sub(replicas.legal_count());
                let targets = self.placement.select_targets(
                    replicas,
                    candidates,
                    self.stats.as_ref(),
                    missing,
                );
                operation.with_targets(targets)
            }
            MaintenanceOperationType::JoinBucket => {
                let sibling = bucket
                    .sibling()
                    .and_then(|s| snapshot.get(&s).map(|r| (s, r.clone())));
                match sibling {
                    Some((sibling, replicas)) => operation.with_sibling(sibling, replicas),
                    None => operation,
                }
            }
            _ => operation,
        }
    }

    fn dispatch(&self, operation: MaintenanceOperation, report: &mut PassReport) {
        let key = operation.sequencing_key();
        if !self.pending.insert(&operation) {
            report.skipped_pending += 1;
            return;
        }
        let lane = self.executor.lane_of(key);
        let guard = PendingGuard::new(self.pending.clone(), key);
        let span = info_span!(
            "maintenance",
            distributor = self.ctx.index,
            bucket = %operation.bucket,
            op = %operation.op,
            lane
        );

        report.record(&operation);
        let db = self.db.clone();
        let handler = self.handler.clone();
        let work = task(
            async move {
                let _guard = guard;
                if !operation.is_current(&db) {
                    debug!("Bucket changed since it was prioritized, skipping");
                    return Ok(());
                }
                handler.execute(&operation).await
            }
            .instrument(span),
        );

        // A rejected task is dropped here, which clears its pending entry
        if let Err(e) = self.executor.submit(lane, work) {
            warn!(lane, "Failed to submit maintenance operation: {}", e);
            if let Some(record) = report.dispatched.pop() {
                if let Some(count) = report.by_type.get_mut(&record.op) {
                    *count -= 1;
                }
            }
            report.failed_submits += 1;
        }
    }

    /// Request a pass without waiting for the interval
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run passes on the configured interval and on [`Scheduler::trigger`]
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        let span = self.ctx.span("scheduler");
        tokio::spawn(
            async move {
                let mut ticker =
                    tokio::time::interval(scheduler.ctx.config.maintenance.pass_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(
                    "Maintenance scheduler started (interval {:?})",
                    scheduler.ctx.config.maintenance.pass_interval()
                );
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = scheduler.trigger.notified() => debug!("Maintenance pass triggered"),
                    }
                    if scheduler.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    scheduler.run_pass().await;
                }
                info!("Maintenance scheduler stopped");
            }
            .instrument(span),
        )
    }

    /// Stop the loop started by [`Scheduler::start`] after its current pass
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.trigger.notify_one();
    }

    /// Wait for every dispatched operation to finish
    pub async fn drain(&self) {
        self.executor.drain().await;
    }

    pub fn last_pass(&self) -> Option<PassReport> {
        self.last_pass.read().clone()
    }

    /// Node load as of the last pass
    pub fn stats(&self) -> NodeStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.pending.list()
    }

    pub fn generator(&self) -> &PriorityGenerator {
        &self.generator
    }
}
