//! Background poller that turns a stop flag into a backend cancel.
//!
//! The event loop of an invocation may sit in a long silent tool run; the
//! monitor keeps checking the session's stop flag on its own timer so a
//! stop takes effect within one poll interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::flags::StopFlags;
use super::gate::{CancelAttempt, CancelGate};

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Keeps a monitor alive. Dropping it aborts the poll task.
#[derive(Debug)]
pub struct MonitorGuard {
    session_id: String,
    task: Option<JoinHandle<()>>,
}

impl MonitorGuard {
    /// Stop polling.
    pub fn stop(mut self) {
        self.abort();
    }

    /// Whether the poll task has ended (after a successful cancel).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(session_id = %self.session_id, "Cancellation monitor stopped");
        }
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Start watching `session_id`'s stop flag for the invocation behind `gate`.
///
/// When the flag is seen, the backend is cancelled through `gate`. Once it is
/// cancelled `token` is fired and polling ends; on failure polling continues
/// and the cancel is retried on a later tick. The gate keeps at most one
/// cancel call in flight, shared with any other caller.
pub fn start(
    session_id: &str,
    gate: Arc<CancelGate>,
    flags: StopFlags,
    token: CancellationToken,
    interval: Duration,
) -> MonitorGuard {
    let sid = session_id.to_string();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !flags.is_stop_requested(&sid).await {
                continue;
            }

            let gate = Arc::clone(&gate);
            let token = token.clone();
            let sid = sid.clone();
            tokio::spawn(async move {
                match gate.cancel().await {
                    Ok(CancelAttempt::InFlight) => {}
                    Ok(_) => {
                        info!(session_id = %sid, "Stop requested, invocation cancelled");
                        token.cancel();
                    }
                    Err(e) => {
                        warn!(session_id = %sid, error = %e, "Backend cancel failed, will retry");
                    }
                }
            });
        }
    });

    debug!(session_id, interval_ms = interval.as_millis(), "Cancellation monitor started");
    MonitorGuard {
        session_id: session_id.to_string(),
        task: Some(task),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{BackendError, InvocationHandle};
    use crate::permission::PermissionDecision;

    #[derive(Default)]
    struct FakeHandle {
        calls: AtomicUsize,
        failures: AtomicUsize,
        latency: Duration,
    }

    #[async_trait]
    impl InvocationHandle for FakeHandle {
        async fn cancel(&self) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BackendError::Cancel("busy".to_string()));
            }
            Ok(())
        }

        async fn respond_permission(
            &self,
            _tool_call_id: &str,
            _decision: &PermissionDecision,
        ) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_fires_token() {
        let handle = Arc::new(FakeHandle::default());
        let flags = StopFlags::new();
        let token = CancellationToken::new();
        let guard = start(
            "s1",
            CancelGate::new(handle.clone()),
            flags.clone(),
            token.clone(),
            DEFAULT_POLL_INTERVAL,
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!token.is_cancelled());
        assert_eq!(handle.calls.load(Ordering::SeqCst), 0);

        flags.request_stop("s1").await;
        tokio::time::timeout(DEFAULT_POLL_INTERVAL * 2, token.cancelled())
            .await
            .unwrap();
        assert_eq!(handle.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(guard.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cancel_is_retried() {
        let handle = Arc::new(FakeHandle {
            failures: AtomicUsize::new(2),
            ..Default::default()
        });
        let flags = StopFlags::new();
        flags.request_stop("s1").await;
        let token = CancellationToken::new();
        let _guard = start(
            "s1",
            CancelGate::new(handle.clone()),
            flags,
            token.clone(),
            DEFAULT_POLL_INTERVAL,
        );

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert_eq!(handle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cancel_is_not_overlapped() {
        let handle = Arc::new(FakeHandle {
            latency: Duration::from_secs(1),
            ..Default::default()
        });
        let flags = StopFlags::new();
        flags.request_stop("s1").await;
        let token = CancellationToken::new();
        let _guard = start(
            "s1",
            CancelGate::new(handle.clone()),
            flags,
            token.clone(),
            DEFAULT_POLL_INTERVAL,
        );

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert_eq!(handle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_already_done_elsewhere_is_not_repeated() {
        let handle = Arc::new(FakeHandle::default());
        let gate = CancelGate::new(handle.clone());
        gate.cancel().await.unwrap();

        let flags = StopFlags::new();
        flags.request_stop("s1").await;
        let token = CancellationToken::new();
        let _guard = start("s1", gate, flags, token.clone(), DEFAULT_POLL_INTERVAL);

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert_eq!(handle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_guard_never_cancels() {
        let handle = Arc::new(FakeHandle::default());
        let flags = StopFlags::new();
        let token = CancellationToken::new();
        let guard = start(
            "s1",
            CancelGate::new(handle.clone()),
            flags.clone(),
            token.clone(),
            DEFAULT_POLL_INTERVAL,
        );
        guard.stop();

        flags.request_stop("s1").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.calls.load(Ordering::SeqCst), 0);
        assert!(!token.is_cancelled());
    }
}
