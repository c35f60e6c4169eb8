//! Worker pool: long-polls a task queue, leases tasks, executes registered
//! activity handlers, heartbeats, and reports outcomes.

pub mod backpressure;
pub mod poller;
pub mod pool;

pub use backpressure::{BackpressureConfig, BackpressureState};
pub use poller::{PollerConfig, TaskPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
