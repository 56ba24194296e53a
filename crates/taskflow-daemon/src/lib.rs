//! taskflow daemon library
//!
//! Session/task orchestration core:
//! - Task lifecycle, timing and session status reflection
//! - Permission gating of tool calls, serialized per session
//! - Cooperative cancellation of agent invocations
//! - Child-to-parent completion callbacks through the message queue
//! - SQLite storage and an NDJSON subprocess agent backend

pub mod backend;
pub mod callback;
pub mod cancellation;
pub mod orchestration;
pub mod permission;
pub mod storage;
pub mod task;
