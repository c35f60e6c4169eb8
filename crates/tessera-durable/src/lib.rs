//! # Tessera Durable Execution Engine
//!
//! An event-sourced workflow orchestration engine for the knowledge-ingestion
//! platform. Workflow executions are identified by a caller-supplied
//! `workflow_id` plus an engine-generated `run_id`; every nondeterministic
//! decision (activity result, timer fire, signal receipt) is recorded in an
//! append-only history and workflow state is rebuilt by replay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (drives workflow state machines, handles event replay)     │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │      ExecutionStore       │   │         QueueRouter          │
//! │ (executions, history,     │   │ (ai-processing / storage /   │
//! │  tasks, timers, signals,  │   │  general queues, saturation) │
//! │  search attrs, inbox)     │   └──────────────────────────────┘
//! └──────────────────────────┘                  │
//!                │                               ▼
//!                │              ┌──────────────────────────────┐
//!                └─────────────▶│   WorkerPool (one per queue)  │
//!                               │ (claims, executes, heartbeats)│
//!                               └──────────────────────────────┘
//! ```
//!
//! The [`engine::EngineRuntime`] runs the background sweeps (completion pump,
//! timers, activity timeouts, run timeouts, lease reclamation) that keep
//! executions moving between external events.

pub mod activity;
pub mod engine;
pub mod fanout;
pub mod persistence;
pub mod reliability;
pub mod router;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivitySet};
    pub use crate::engine::{
        EngineRuntime, ExecutorConfig, ExecutorError, StartOptions, WorkflowExecutor,
        WorkflowRegistry,
    };
    pub use crate::fanout::SignalFanout;
    pub use crate::persistence::{
        ClaimedTask, ExecutionStore, IdReusePolicy, InMemoryExecutionStore, InboxKind,
        PostgresExecutionStore, StoreError, TaskDefinition, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::router::{QueueRouter, TaskQueue};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, AttributeValue, Decision, EventKind, Signal, Workflow, WorkflowContext,
        WorkflowError,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivitySet};
pub use engine::{
    EngineRuntime, ExecutorConfig, ExecutorError, StartOptions, WorkflowExecutor, WorkflowRegistry,
};
pub use fanout::SignalFanout;
pub use persistence::{
    ExecutionStore, IdReusePolicy, InMemoryExecutionStore, PostgresExecutionStore, StoreError,
    WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use router::{QueueRouter, TaskQueue};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, AttributeValue, Decision, EventKind, Signal, Workflow, WorkflowContext,
    WorkflowError,
};
