//! Workflow registry for type-erased workflow creation
//!
//! The registry maps workflow type names to factories that create workflow
//! instances from JSON input, so the executor can replay any registered
//! definition without knowing its concrete type.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::activity::ActivityError;
use crate::workflow::{Decision, Signal, Workflow, WorkflowContext, WorkflowError};

/// Type-erased workflow interface
///
/// All parameters and return values are JSON; the wrapper performs the
/// typed (de)serialization at the boundary.
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<Decision>;

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<Decision>;

    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<Decision>;

    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<Decision>;

    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &Signal) -> Vec<Decision>;

    fn on_child_completed(
        &mut self,
        ctx: &WorkflowContext,
        child_workflow_id: &str,
        result: Value,
    ) -> Vec<Decision>;

    fn on_child_failed(
        &mut self,
        ctx: &WorkflowContext,
        child_workflow_id: &str,
        error: &WorkflowError,
    ) -> Vec<Decision>;

    fn query(&self, query_name: &str) -> Option<Value>;

    fn is_finished(&self) -> bool;

    /// Result as JSON (if completed successfully)
    fn result_json(&self) -> Option<Value>;

    fn error(&self) -> Option<WorkflowError>;
}

/// Wrapper implementing AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<Decision> {
        self.inner.on_start(ctx)
    }

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<Decision> {
        self.inner.on_activity_completed(ctx, activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<Decision> {
        self.inner.on_activity_failed(ctx, activity_id, error)
    }

    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<Decision> {
        self.inner.on_timer_fired(ctx, timer_id)
    }

    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &Signal) -> Vec<Decision> {
        self.inner.on_signal(ctx, signal)
    }

    fn on_child_completed(
        &mut self,
        ctx: &WorkflowContext,
        child_workflow_id: &str,
        result: Value,
    ) -> Vec<Decision> {
        self.inner.on_child_completed(ctx, child_workflow_id, result)
    }

    fn on_child_failed(
        &mut self,
        ctx: &WorkflowContext,
        child_workflow_id: &str,
        error: &WorkflowError,
    ) -> Vec<Decision> {
        self.inner.on_child_failed(ctx, child_workflow_id, error)
    }

    fn query(&self, query_name: &str) -> Option<Value> {
        self.inner.query(query_name)
    }

    fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    fn result_json(&self) -> Option<Value> {
        self.inner
            .result()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
    }

    fn error(&self) -> Option<WorkflowError> {
        self.inner.error()
    }
}

/// Factory function type for creating workflows from JSON input
pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Registry of workflow factories
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a workflow type.
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            let workflow = W::new(typed_input);
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Create a workflow instance from type name and JSON input.
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(input).map_err(RegistryError::Deserialization)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Failed to deserialize workflow input
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}
