//! Sequenced task execution
//!
//! Runs many tasks in parallel while tasks sharing a key run in sequence:
//! - [`LaneExecutor`]: fixed lanes, FIFO per lane, `drain` barrier
//! - [`ExecutorObserver`]: counting decorator over any executor
//!
//! # Usage Example
//! ```ignore
//! use sequenced::{task, LaneExecutor, SequencedExecutor};
//!
//! let executor = LaneExecutor::new(4);
//! let lane = executor.lane_of(bucket.raw());
//! executor.submit(lane, task(async move { repair(bucket).await }))?;
//! executor.drain().await;
//! ```

pub mod executor;
pub mod observer;

pub use executor::{task, ExecutorError, LaneExecutor, LaneId, SequencedExecutor, Task};
pub use observer::{ExecutorObserver, DEFAULT_HISTORY_CAPACITY};
