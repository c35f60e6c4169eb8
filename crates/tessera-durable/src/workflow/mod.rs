//! Workflow programming model: definitions, decisions, events, signals and
//! search attributes.

pub mod attributes;
pub mod decision;
pub mod definition;
pub mod event;
pub mod signal;

pub use attributes::{AttributeFilter, AttributeValue};
pub use decision::{ActivityOptions, Decision};
pub use definition::{Workflow, WorkflowContext, WorkflowError};
pub use event::{EventKind, HistoryEvent, TimeoutKind};
pub use signal::{ReviewDecision, ReviewVerdict, Signal, SIGNAL_CHANNEL_CAPACITY};
