//! Session/task orchestration.
//!
//! [`Orchestrator`] accepts prompts, runs one agent invocation per session,
//! gates tool calls through the permission coordinator, honours stop
//! requests and drains session queues.

mod orchestrator;
mod queue;
mod runner;
mod types;

pub use orchestrator::Orchestrator;
pub use queue::OrchestratorTrigger;
pub use types::{
    ORPHANED_REASON, OrchestratorConfig, OrchestratorError, RunningInvocation, StopResult,
};
