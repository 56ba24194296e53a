//! Single entry point for cancelling an invocation's backend.
//!
//! The monitor and the run loop can both decide to cancel the same
//! invocation. Routing them through one gate means the backend sees at most
//! one cancel in flight and none after a successful one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::backend::{BackendError, InvocationHandle};

/// What a call to [`CancelGate::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAttempt {
    /// This call cancelled the backend.
    Cancelled,
    /// An earlier call already cancelled it.
    AlreadyCancelled,
    /// Another call is cancelling it right now.
    InFlight,
}

impl CancelAttempt {
    /// Whether the backend is known to be cancelled.
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled | Self::AlreadyCancelled)
    }
}

/// Shared wrapper around an [`InvocationHandle`]'s `cancel`.
pub struct CancelGate {
    handle: Arc<dyn InvocationHandle>,
    in_flight: AtomicBool,
    cancelled: AtomicBool,
}

impl CancelGate {
    pub fn new(handle: Arc<dyn InvocationHandle>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            in_flight: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel the backend unless that already happened or is happening.
    ///
    /// A failed cancel leaves the gate open so a later call can retry.
    pub async fn cancel(&self) -> Result<CancelAttempt, BackendError> {
        if self.is_cancelled() {
            return Ok(CancelAttempt::AlreadyCancelled);
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Backend cancel already in flight");
            return Ok(CancelAttempt::InFlight);
        }
        // A cancel may have finished between the two checks above.
        if self.is_cancelled() {
            self.in_flight.store(false, Ordering::Release);
            return Ok(CancelAttempt::AlreadyCancelled);
        }

        let result = self.handle.cancel().await;
        if result.is_ok() {
            self.cancelled.store(true, Ordering::Release);
        }
        self.in_flight.store(false, Ordering::Release);
        result.map(|()| CancelAttempt::Cancelled)
    }
}
