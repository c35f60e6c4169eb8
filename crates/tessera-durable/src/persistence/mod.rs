//! Persistence layer: the `ExecutionStore` contract plus the in-memory and
//! PostgreSQL implementations.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;
pub use store::{
    ClaimedTask, CompletionReport, DueTimer, ExecutionRecord, ExecutionStore, HeartbeatResponse,
    IdReusePolicy, InboxKind, InboxSignal, NewExecution, ParentRef, StoreError, TaskDefinition,
    TaskFailureOutcome, TaskOutcome, TimedOutTask, WorkerInfo, WorkflowStatus,
};
