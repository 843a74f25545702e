use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sequenced::{task, ExecutorObserver, LaneExecutor, SequencedExecutor};
use tokio::sync::oneshot;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_lane_runs_in_submission_order() {
    let executor = LaneExecutor::new(4);
    let lane = executor.lane_of(7);
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100u64 {
        let seen = seen.clone();
        executor
            .submit(lane, task(async move {
                // Some tasks yield for a while; order must still hold
                if i % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                seen.lock().push(i);
                Ok(())
            }))
            .unwrap();
    }
    executor.drain().await;

    assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_task_at_a_time_per_lane() {
    let executor = LaneExecutor::new(2);
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let running = running.clone();
        let max_running = max_running.clone();
        executor
            .submit(0, task(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
    }
    executor.drain().await;

    assert_eq!(max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_lanes_run_concurrently() {
    let executor = LaneExecutor::new(2);
    let (tx, rx) = oneshot::channel::<()>();

    // Lane 0 blocks until lane 1 has run; a serialized executor would hang
    executor
        .submit(0, task(async move {
            rx.await?;
            Ok(())
        }))
        .unwrap();
    executor
        .submit(1, task(async move {
            let _ = tx.send(());
            Ok(())
        }))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), executor.drain())
        .await
        .expect("lanes should not block each other");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_waits_for_previously_submitted_tasks() {
    let executor = LaneExecutor::new(4);
    let done = Arc::new(AtomicUsize::new(0));

    for i in 0..16usize {
        let done = done.clone();
        executor
            .submit(i % 4, task(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
    }
    executor.drain().await;

    assert_eq!(done.load(Ordering::SeqCst), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_and_panicking_tasks_do_not_stop_lane() {
    let executor = LaneExecutor::new(1);
    let after = Arc::new(AtomicUsize::new(0));

    executor
        .submit(0, task(async { Err(anyhow::anyhow!("merge rejected by node")) }))
        .unwrap();
    executor
        .submit(0, task(async {
            if true {
                panic!("task blew up");
            }
            Ok(())
        }))
        .unwrap();
    let counter = after.clone();
    executor
        .submit(0, task(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), executor.drain())
        .await
        .expect("drain must not be blocked by failed tasks");
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observer_preserves_ordering() {
    let observer = ExecutorObserver::new(Arc::new(LaneExecutor::new(4)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let lane = observer.lane_of(99);

    for i in 0..50u32 {
        let seen = seen.clone();
        observer
            .submit(lane, task(async move {
                seen.lock().push(i);
                Ok(())
            }))
            .unwrap();
    }
    observer.drain().await;

    assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    assert_eq!(observer.execute_count(), 50);
    assert_eq!(observer.drain_count(), 1);
    assert!(observer.execute_history().iter().all(|l| *l == lane));
}
