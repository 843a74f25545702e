//! Executor observer
//!
//! Wraps another executor and records what passes through it. Ordering
//! and liveness stay entirely with the wrapped executor; the observer only
//! counts and forwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::executor::{ExecutorError, LaneId, SequencedExecutor, Task};

/// Submits kept in the execute history by default
pub const DEFAULT_HISTORY_CAPACITY: usize = 4096;

/// Observing decorator over a [`SequencedExecutor`]
pub struct ExecutorObserver {
    inner: Arc<dyn SequencedExecutor>,
    execute_count: AtomicU64,
    drain_count: AtomicU64,
    lane_counts: Vec<AtomicU64>,
    /// Lanes of the most recent accepted submits, in call order
    history: Mutex<VecDeque<LaneId>>,
    history_capacity: usize,
}

impl ExecutorObserver {
    pub fn new(inner: Arc<dyn SequencedExecutor>) -> Self {
        Self::with_history_capacity(inner, DEFAULT_HISTORY_CAPACITY)
    }

    /// Observer remembering the lanes of at most `capacity` recent submits;
    /// zero disables the history
    pub fn with_history_capacity(inner: Arc<dyn SequencedExecutor>, capacity: usize) -> Self {
        let lane_counts = (0..inner.lane_count()).map(|_| AtomicU64::new(0)).collect();
        Self {
            inner,
            execute_count: AtomicU64::new(0),
            drain_count: AtomicU64::new(0),
            lane_counts,
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            history_capacity: capacity,
        }
    }

    /// Accepted submits
    pub fn execute_count(&self) -> u64 {
        self.execute_count.load(Ordering::Relaxed)
    }

    /// Completed drains
    pub fn drain_count(&self) -> u64 {
        self.drain_count.load(Ordering::Relaxed)
    }

    /// Lanes of the most recent submits, oldest first
    pub fn execute_history(&self) -> Vec<LaneId> {
        self.history.lock().iter().copied().collect()
    }

    /// Accepted submits per lane
    pub fn lane_counts(&self) -> Vec<u64> {
        self.lane_counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

#[async_trait]
impl SequencedExecutor for ExecutorObserver {
    fn lane_count(&self) -> usize {
        self.inner.lane_count()
    }

    fn lane_of(&self, key: u64) -> LaneId {
        self.inner.lane_of(key)
    }

    fn submit(&self, lane: LaneId, task: Task) -> Result<(), ExecutorError> {
        self.inner.submit(lane, task)?;
        self.execute_count.fetch_add(1, Ordering::Relaxed);
        if let Some(count) = self.lane_counts.get(lane) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        if self.history_capacity > 0 {
            let mut history = self.history.lock();
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(lane);
        }
        Ok(())
    }

    async fn drain(&self) {
        self.inner.drain().await;
        self.drain_count.fetch_add(1, Ordering::Relaxed);
    }
}
