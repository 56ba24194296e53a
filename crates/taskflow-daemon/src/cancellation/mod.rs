//! Cooperative cancellation of active invocations.

mod flags;
mod gate;
pub mod monitor;

pub use flags::StopFlags;
pub use gate::{CancelAttempt, CancelGate};
pub use monitor::{DEFAULT_POLL_INTERVAL, MonitorGuard};
