//! Workflow engine: type registry, replaying executor and background
//! runtime loops.

pub mod executor;
pub mod registry;
pub mod runtime;

pub use executor::{
    DescribeResult, ExecutorConfig, ExecutorError, StartOptions, WorkflowExecutor,
};
pub use registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
pub use runtime::{EngineRuntime, EngineRuntimeConfig};
