//! Activity abstractions: the `Activity` trait, execution context and the
//! handler registration table workers run against.

pub mod context;
pub mod definition;
pub mod set;

pub use context::{ActivityContext, CancellationHandle, HeartbeatError, HeartbeatPayload};
pub use definition::{error_types, Activity, ActivityError};
pub use set::{ActivityHandler, ActivityResult, ActivitySet};
