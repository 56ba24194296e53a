//! Agent backends.
//!
//! An invocation is a stream of discrete events plus a handle that can
//! cancel it or answer its permission requests.

mod subprocess;
mod types;

pub use subprocess::SubprocessBackend;
pub use types::{
    AgentBackend, BackendError, BackendEvent, BackendEventStream, Invocation, InvocationContext,
    InvocationHandle,
};
