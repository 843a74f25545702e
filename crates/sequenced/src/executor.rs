//! Lane executor
//!
//! Runs tasks on a fixed number of lanes. Each lane is a single-consumer
//! queue owned by one worker: tasks in a lane run one at a time in
//! submission order, lanes run concurrently with each other.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use crc::{Crc, CRC_32_ISCSI};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// CRC32C calculator for lane selection
static LANE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Lane index, `0..lane_count`
pub type LaneId = usize;

/// Unit of work submitted to a lane
pub type Task = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Box a future into a [`Task`]
pub fn task<F>(fut: F) -> Task
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::pin(fut)
}

/// Executor errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("lane {lane} out of range (lane count {lanes})")]
    LaneOutOfRange { lane: LaneId, lanes: usize },
    #[error("lane {0} is closed")]
    Closed(LaneId),
}

/// Ordered concurrent execution keyed by an opaque component id
#[async_trait]
pub trait SequencedExecutor: Send + Sync {
    /// Number of lanes, fixed at construction
    fn lane_count(&self) -> usize;

    /// Lane for a key; the same key always maps to the same lane
    fn lane_of(&self, key: u64) -> LaneId;

    /// Enqueue a task at the tail of a lane
    fn submit(&self, lane: LaneId, task: Task) -> Result<(), ExecutorError>;

    /// Wait until every task submitted before this call has completed
    async fn drain(&self);
}

enum LaneMessage {
    Run(Task),
    Barrier(oneshot::Sender<()>),
}

/// Fixed-size array of lanes, one tokio worker per lane
pub struct LaneExecutor {
    senders: Vec<mpsc::UnboundedSender<LaneMessage>>,
    workers: Vec<JoinHandle<()>>,
}

impl LaneExecutor {
    /// Create the executor and spawn its lane workers
    ///
    /// Must be called from within a tokio runtime. A zero lane count is
    /// raised to one.
    pub fn new(lane_count: usize) -> Self {
        let lane_count = lane_count.max(1);
        let mut senders = Vec::with_capacity(lane_count);
        let mut workers = Vec::with_capacity(lane_count);

        for lane in 0..lane_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            workers.push(tokio::spawn(
                run_lane(lane, rx).instrument(info_span!("lane", lane)),
            ));
        }

        info!("Lane executor started with {} lanes", lane_count);

        Self { senders, workers }
    }

    /// Close all lanes and wait for queued tasks to finish
    pub async fn shutdown(self) {
        let LaneExecutor { senders, workers } = self;
        drop(senders);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Lane worker exited abnormally: {}", e);
            }
        }
        info!("Lane executor stopped");
    }

    fn sender(&self, lane: LaneId) -> Result<&mpsc::UnboundedSender<LaneMessage>, ExecutorError> {
        self.senders.get(lane).ok_or(ExecutorError::LaneOutOfRange {
            lane,
            lanes: self.senders.len(),
        })
    }
}

#[async_trait]
impl SequencedExecutor for LaneExecutor {
    fn lane_count(&self) -> usize {
        self.senders.len()
    }

    fn lane_of(&self, key: u64) -> LaneId {
        LANE_CRC.checksum(&key.to_le_bytes()) as usize % self.senders.len()
    }

    fn submit(&self, lane: LaneId, task: Task) -> Result<(), ExecutorError> {
        self.sender(lane)?
            .send(LaneMessage::Run(task))
            .map_err(|_| ExecutorError::Closed(lane))
    }

    async fn drain(&self) {
        // A barrier queued behind everything already in each lane
        let mut barriers = Vec::with_capacity(self.senders.len());
        for (lane, sender) in self.senders.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if sender.send(LaneMessage::Barrier(tx)).is_ok() {
                barriers.push(rx);
            } else {
                debug!(lane, "Skipping closed lane in drain");
            }
        }
        for barrier in barriers {
            let _ = barrier.await;
        }
    }
}

/// Lane worker: runs tasks strictly one after another
///
/// Each task is spawned and awaited so that a panic is contained to the
/// task; errors and panics are logged and the lane moves on.
async fn run_lane(lane: LaneId, mut rx: mpsc::UnboundedReceiver<LaneMessage>) {
    debug!("Lane worker {} started", lane);

    while let Some(message) = rx.recv().await {
        match message {
            LaneMessage::Run(task) => match tokio::spawn(task).await {
                Ok(Ok(())) => trace!("Task completed"),
                Ok(Err(e)) => warn!(error = %e, "Task failed"),
                Err(e) if e.is_panic() => error!("Task panicked: {}", e),
                Err(e) => warn!("Task cancelled: {}", e),
            },
            LaneMessage::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Lane worker {} stopped", lane);
}
