//! Timing bookkeeping for task transitions.
//!
//! Pure functions over the stored task and the caller's patch; the
//! lifecycle manager decides which one applies.

use crate::storage::{Task, TaskPatch};

/// Fill the timing fields of a task that is entering a terminal status.
///
/// Caller-supplied values win. `duration_ms` is only derived when absent, so
/// an explicit `0` survives.
pub fn apply_terminal_timing(task: &Task, patch: &mut TaskPatch, now: i64) {
    let completed_at = *patch.completed_at.get_or_insert(now);

    let start_timestamp = patch
        .message_range
        .start_timestamp
        .or(task.message_range.start_timestamp);

    if patch.duration_ms.is_none() {
        let start_reference = patch
            .started_at
            .or(task.started_at)
            .or(start_timestamp)
            .unwrap_or(task.created_at);
        patch.duration_ms = Some((completed_at - start_reference).max(0));
    }

    let end_timestamp = patch
        .message_range
        .end_timestamp
        .or(task.message_range.end_timestamp);
    if end_timestamp.is_none() || end_timestamp == start_timestamp {
        patch.message_range.end_timestamp = Some(completed_at);
    }
}

/// Drop timing fields from a patch aimed at an already-terminal task.
pub fn strip_terminal_timing(patch: &mut TaskPatch) {
    patch.completed_at = None;
    patch.duration_ms = None;
    patch.message_range.end_timestamp = None;
}

/// Stamp `started_at` for a task entering `running` for the first time.
pub fn stamp_started(task: &Task, patch: &mut TaskPatch, now: i64) {
    if task.started_at.is_none() && patch.started_at.is_none() {
        patch.started_at = Some(now);
    }
}
