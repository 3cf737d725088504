//! Per-execution timeout governor.
//!
//! A timer is a tokio task sleeping until the deadline. It never keeps the
//! host alive on its own: dropping the runtime drops pending timers. On fire
//! it races the other resolution paths through the request's `done` flag and
//! does nothing if it lost.

use std::sync::Arc;

use tokio::task::AbortHandle;

use crate::config::ScriptTimeout;
use crate::correlation::PendingRequest;

/// Handle to an armed timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: AbortHandle,
}

impl TimerHandle {
    /// Disarm the timer. Cancelling a fired or cancelled timer is a no-op.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Arm a timer for `pending`.
///
/// Returns `None` when the timeout is disabled. `on_timeout` runs at most once,
/// and only if the timer flipped the request's `done` flag itself.
pub fn arm<F>(pending: &Arc<PendingRequest>, timeout: ScriptTimeout, on_timeout: F) -> Option<TimerHandle>
where
    F: FnOnce(&PendingRequest) + Send + 'static,
{
    let duration = timeout.duration()?;
    let pending = Arc::clone(pending);

    let task = tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        if !pending.mark_done() {
            return;
        }
        tracing::debug!(
            "Request {} timed out after {}ms",
            pending.request_id(),
            duration.as_millis()
        );
        on_timeout(&pending);
    });

    Some(TimerHandle {
        task: task.abort_handle(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::correlation::RequestId;

    fn pending() -> Arc<PendingRequest> {
        let (tx, _rx) = oneshot::channel();
        Arc::new(PendingRequest::new(RequestId::new(), None, tx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_deadline() {
        let request = pending();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let _timer = arm(&request, ScriptTimeout::After(Duration::from_millis(10)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(request.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let request = pending();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let timer = arm(&request, ScriptTimeout::After(Duration::from_millis(10)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!request.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fire_when_already_done() {
        let request = pending();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let _timer = arm(&request, ScriptTimeout::After(Duration::from_millis(10)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // The worker response won the race.
        assert!(request.mark_done());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_timeout_arms_nothing() {
        let request = pending();
        assert!(arm(&request, ScriptTimeout::Disabled, |_| {}).is_none());
    }
}
