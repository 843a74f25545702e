mod common;

use std::sync::Arc;
use std::time::Duration;

use bucket_core::{BucketId, BucketInfo, DiskIndex};
use distributor::maintenance::NodeLoad;
use distributor::{BucketReport, Distributor, NodeState};
use sequenced::{task, SequencedExecutor};
use tokio::sync::oneshot;

use common::{bucket, config, healthy, report_all, setup, RecordingHandler};

use distributor::maintenance::MaintenanceOperationType::*;
use distributor::maintenance::MaintenancePriority::{High, Low, Medium};

/// Park the single lane until the returned sender fires
fn block_lane(d: &Distributor) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel::<()>();
    d.executor()
        .submit(0, task(async move {
            let _ = rx.await;
            Ok(())
        }))
        .unwrap();
    tx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pass_ranks_by_priority_then_bucket() {
    let (d, handler) = setup(config());

    let copy = bucket(5);
    report_all(&d, copy, &[0], healthy(), 1);

    let merge = bucket(3);
    report_all(&d, merge, &[0, 1], BucketInfo::new(10, 5, 50), 1);
    report_all(&d, merge, &[2], BucketInfo::new(11, 5, 50), 1);

    let split = bucket(9);
    report_all(&d, split, &[0, 1, 2], BucketInfo::new(1, 1_000_000, 1000), 1);

    let fine = bucket(7);
    report_all(&d, fine, &[0, 1, 2], healthy(), 1);

    let surplus = bucket(1);
    report_all(&d, surplus, &[0, 1, 2, 3], healthy(), 1);

    let report = d.run_pass().await;
    assert_eq!(report.buckets_scanned, 5);
    assert!(report.drained);

    let mut high = vec![copy, split];
    high.sort();
    let expected: Vec<BucketId> = high.into_iter().chain([merge, surplus]).collect();
    let dispatched: Vec<BucketId> = report.dispatched.iter().map(|r| r.bucket).collect();
    assert_eq!(dispatched, expected);

    let priorities: Vec<_> = report.dispatched.iter().map(|r| r.priority).collect();
    assert_eq!(priorities, vec![High, High, Medium, Low]);

    // one lane, drained: execution order is dispatch order
    let executed: Vec<BucketId> = handler.executed().iter().map(|op| op.bucket).collect();
    assert_eq!(executed, expected);

    let copy_op = handler
        .executed()
        .into_iter()
        .find(|op| op.op == CopyBucket)
        .unwrap();
    assert_eq!(copy_op.targets, vec![1, 2]);

    assert_eq!(report.by_type.get(&MergeBucket), Some(&1));
    assert_eq!(report.by_type.get(&DeleteBucket), Some(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pass_order_is_reproducible() {
    let build = || {
        let (d, _) = setup(config());
        for id in 0..20u64 {
            let nodes: Vec<u16> = (0..(id % 5) as u16).collect();
            report_all(&d, bucket(id), &nodes, BucketInfo::new(id as u32, 10 + id as u32, 100), 1);
        }
        d
    };

    let first = build().run_pass().await.dispatched;
    let second = build().run_pass().await.dispatched;
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pass_records_node_load() {
    let (d, _) = setup(config());
    let merge = bucket(3);
    report_all(&d, merge, &[0, 1], BucketInfo::new(10, 5, 50), 1);
    report_all(&d, merge, &[2], BucketInfo::new(11, 5, 50), 1);
    report_all(&d, bucket(4), &[3], healthy(), 1);

    d.run_pass().await;
    let stats = d.scheduler().stats();
    for node in [0, 1, 2] {
        assert_eq!(stats.node_stats(node).pending_merge, 1);
    }
    assert_eq!(stats.node_stats(3).pending_copy_out, 1);
    assert_eq!(stats.node_stats(0).pending_copy_in, 1);
    assert_eq!(stats.node_stats(1).pending_copy_in, 1);

    // reset at the start of the next pass
    report_all(&d, merge, &[2], BucketInfo::new(10, 5, 50), 2);
    report_all(&d, bucket(4), &[0, 1], healthy(), 1);
    d.run_pass().await;
    assert!(d.scheduler().stats().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_merge_backpressure_within_pass() {
    let mut config = config();
    config.maintenance.merge_backpressure_ceiling = 1;
    let (d, _) = setup(config);

    // three buckets diverged on all three replicas
    let buckets: Vec<BucketId> = (0..3u64).map(|i| bucket(0x100 + i)).collect();
    for b in &buckets {
        for node in 0..3u16 {
            d.report_bucket_info(node, *b, BucketInfo::new(node as u32, 5, 50), DiskIndex::Disk(0), 1)
                .unwrap();
        }
    }

    let report = d.run_pass().await;
    assert_eq!(report.by_type.get(&MergeBucket), Some(&3));

    // the third bucket in key order sees two pending merges per node
    let mut ordered = buckets.clone();
    ordered.sort();
    let discounted: Vec<_> = report
        .dispatched
        .iter()
        .filter(|r| r.priority == Medium)
        .map(|r| r.bucket)
        .collect();
    assert_eq!(discounted, vec![ordered[2]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_operation_becomes_noop() {
    let mut config = config();
    config.maintenance.drain_after_pass = false;
    let (d, handler) = setup(config);

    let b = bucket(3);
    report_all(&d, b, &[0, 1], BucketInfo::new(10, 5, 50), 1);
    report_all(&d, b, &[2], BucketInfo::new(11, 5, 50), 1);

    let gate = block_lane(&d);
    let report = d.run_pass().await;
    assert_eq!(report.dispatched.len(), 1);

    // the replicas converge before the merge gets to run
    report_all(&d, b, &[2], BucketInfo::new(10, 5, 50), 2);
    gate.send(()).unwrap();
    d.scheduler().drain().await;

    assert!(handler.executed().is_empty());
    assert!(d.scheduler().pending().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_bucket_operation_becomes_noop() {
    let mut config = config();
    config.maintenance.drain_after_pass = false;
    let (d, handler) = setup(config);

    let b = bucket(8);
    report_all(&d, b, &[0], healthy(), 1);

    let gate = block_lane(&d);
    d.run_pass().await;
    d.database().remove(&b);
    gate.send(()).unwrap();
    d.scheduler().drain().await;

    assert!(handler.executed().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_bucket_skipped_until_finished() {
    let mut config = config();
    config.maintenance.drain_after_pass = false;
    let (d, handler) = setup(config);

    let b = bucket(3);
    report_all(&d, b, &[0, 1], BucketInfo::new(10, 5, 50), 1);
    report_all(&d, b, &[2], BucketInfo::new(11, 5, 50), 1);

    let gate = block_lane(&d);
    assert_eq!(d.run_pass().await.dispatched.len(), 1);

    let second = d.run_pass().await;
    assert!(second.dispatched.is_empty());
    assert_eq!(second.skipped_pending, 1);
    // the in-flight merge still counts as load
    assert_eq!(d.scheduler().stats().node_stats(0).pending_merge, 1);
    assert_eq!(d.scheduler().pending().len(), 1);

    gate.send(()).unwrap();
    d.scheduler().drain().await;
    assert_eq!(handler.executed().len(), 1);

    // nothing changed the replicas, so the merge is planned again
    assert_eq!(d.run_pass().await.dispatched.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_dispatched_once_per_parent() {
    let (d, handler) = setup(config());
    let left = bucket(0x11);
    let right = left.sibling().unwrap();
    let small = BucketInfo::new(7, 10, 100);
    report_all(&d, left, &[0, 1, 2], small, 1);
    report_all(&d, right, &[0, 1, 2], small, 1);

    let report = d.run_pass().await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].op, JoinBucket);
    assert_eq!(report.dispatched[0].bucket, left.min(right));

    let executed = handler.executed();
    assert_eq!(executed.len(), 1);
    let (sibling, _) = executed[0].sibling.clone().unwrap();
    assert_eq!(sibling, left.max(right));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_waits_for_under_replicated_sibling() {
    let mut config = config();
    config.executor.lanes = 8;
    let (d, handler) = setup(config);
    let full = BucketId::new(16, 0x8000).unwrap();
    let thin = full.sibling().unwrap();
    let small = BucketInfo::new(7, 10, 100);
    report_all(&d, full, &[0, 1, 2], small, 1);
    report_all(&d, thin, &[3], small, 1);

    let report = d.run_pass().await;
    let ops: Vec<_> = report.dispatched.iter().map(|r| (r.bucket, r.op)).collect();
    assert_eq!(ops, vec![(thin, CopyBucket)]);
    assert!(handler.executed().iter().all(|op| op.op != JoinBucket));

    // once the copy has landed the siblings join
    report_all(&d, thin, &[4, 5], small, 1);
    let report = d.run_pass().await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].op, JoinBucket);
    let join = handler.executed().pop().unwrap();
    assert_eq!(join.sequencing_key(), full.parent().unwrap().raw());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_skipped_while_sibling_operation_pending() {
    let mut config = config();
    config.maintenance.drain_after_pass = false;
    let (d, handler) = setup(config);
    let full = BucketId::new(16, 0x8000).unwrap();
    let thin = full.sibling().unwrap();
    let small = BucketInfo::new(7, 10, 100);
    report_all(&d, full, &[0, 1, 2], small, 1);
    report_all(&d, thin, &[3], small, 1);

    let gate = block_lane(&d);
    let first = d.run_pass().await;
    assert_eq!(first.dispatched.len(), 1);
    assert_eq!(first.dispatched[0].op, CopyBucket);

    // the sibling is whole again but its copy has not run yet
    report_all(&d, thin, &[4, 5], small, 1);
    let second = d.run_pass().await;
    assert!(second.dispatched.is_empty());
    assert_eq!(second.skipped_pending, 2);

    gate.send(()).unwrap();
    d.scheduler().drain().await;
    // the copy found the sibling changed and did nothing
    assert!(handler.executed().is_empty());

    let third = d.run_pass().await;
    assert_eq!(third.dispatched.len(), 1);
    assert_eq!(third.dispatched[0].op, JoinBucket);
    d.scheduler().drain().await;
    assert_eq!(handler.executed().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_down_leads_to_copy() {
    let (d, handler) = setup(config());
    let b = bucket(0x42);
    report_all(&d, b, &[0, 1, 2], healthy(), 1);
    assert!(d.run_pass().await.dispatched.is_empty());

    assert_eq!(d.set_node_state(2, NodeState::Down), 1);
    // maintenance and retired nodes are not copy targets
    d.set_node_state(3, NodeState::Maintenance);
    d.set_node_state(4, NodeState::Retired);

    let report = d.run_pass().await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].op, CopyBucket);
    assert_eq!(report.dispatched[0].priority, Medium);
    assert_eq!(handler.executed()[0].targets, vec![5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_copy_without_targets_is_not_dispatched() {
    let mut config = config();
    config.cluster.node_count = 2;
    let (d, _) = setup(config);
    report_all(&d, bucket(1), &[0, 1], healthy(), 1);

    let report = d.run_pass().await;
    assert!(report.dispatched.is_empty());
    assert_eq!(report.unplaceable, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_region_limits_pass() {
    let mut config = config();
    config.distributor.region = Some(BucketId::new(1, 0).unwrap());
    let (d, _) = setup(config);

    // even ids fall in the region, odd ids do not
    report_all(&d, bucket(2), &[0], healthy(), 1);
    report_all(&d, bucket(3), &[0], healthy(), 1);

    let report = d.run_pass().await;
    assert_eq!(report.buckets_scanned, 1);
    assert_eq!(report.dispatched[0].bucket, bucket(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_handler_does_not_block_passes() {
    let handler = Arc::new(RecordingHandler::failing());
    let d = Distributor::new(config(), handler.clone()).unwrap();
    report_all(&d, bucket(1), &[0], healthy(), 1);
    report_all(&d, bucket(2), &[1], healthy(), 1);

    let first = tokio::time::timeout(Duration::from_secs(5), d.run_pass())
        .await
        .unwrap();
    assert_eq!(first.dispatched.len(), 2);
    assert_eq!(handler.executed().len(), 2);

    let second = d.run_pass().await;
    assert_eq!(second.dispatched.len(), 2);
    assert_eq!(second.skipped_pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_loop_applies_reports_and_runs_passes() {
    let mut config = config();
    config.maintenance.pass_interval_ms = 20;
    let (d, handler) = setup(config);
    let handles = d.start();

    let b = bucket(0x99);
    d.report_sink()
        .report(BucketReport::new(0, b, healthy(), DiskIndex::Disk(0), 1))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.executed().is_empty() {
            d.scheduler().trigger();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a pass should dispatch the copy");

    assert_eq!(handler.executed()[0].bucket, b);
    assert!(d.scheduler().last_pass().is_some());

    d.shutdown().await;
    for handle in handles {
        handle.abort();
    }
}
