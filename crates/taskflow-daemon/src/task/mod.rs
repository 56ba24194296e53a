//! Task lifecycle: state transitions, timing and session reflection.

mod lifecycle;
pub mod timing;

pub use lifecycle::{LifecycleError, TaskLifecycle};
