use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellation handle for one armed timer.
///
/// Firing and cancelling race on a single atomic; whichever leaves `ARMED`
/// first wins and the other becomes a no-op.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    state: Arc<AtomicU8>,
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    next_id: AtomicU64,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `callback` once after `after` unless cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F, Fut>(&self, after: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(AtomicU8::new(ARMED));
        let task_state = state.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if task_state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(timer_id = id, "timer fired");
                callback().await;
            }
        });

        TimerHandle {
            id,
            state,
            abort: task.abort_handle(),
        }
    }

    /// Returns true if this call prevented the callback from running.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let cancelled = handle
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        // Only abort a sleeping task. A fired task may be inside its callback.
        if cancelled {
            handle.abort.abort();
            debug!(timer_id = handle.id, "timer cancelled");
        }
        cancelled
    }
}
