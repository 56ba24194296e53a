//! Permission coordination between agent backends and decision makers.
//!
//! Tool calls that need approval suspend only their own run while a user or
//! client decides; requests are delivered one at a time per session.

mod coordinator;
mod types;

pub use coordinator::{CoordinatorConfig, PendingPermission, PermissionCoordinator};
pub use types::{
    DECIDED_BY_GRANT, DECIDED_BY_SYSTEM, PermissionDecision, PermissionError, PermissionEvent,
    PermissionOutcome, PermissionRequest, PermissionScope, REASON_CANCELLED, REASON_TIMEOUT,
};
