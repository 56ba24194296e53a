//! `SQLite` storage for the taskflow daemon.
//!
//! Provides persistence for sessions, tasks, messages and per-session
//! message queues, plus the [`Store`] trait the orchestration core is
//! written against.

mod db;
mod models;
mod queries;
mod queries_messages;
mod store;

pub use db::{Database, DatabaseError};
pub use models::{
    CallbackConfig, Genealogy, Message, MessageRange, MessageRole, NewMessage, NewSession,
    NewTask, QueueMetadata, QueuedMessage, Session, SessionPatch, SessionStatus, Task, TaskPatch,
    TaskStatus,
};
pub use store::Store;
