//! Correlation registry for in-flight executions.
//!
//! Maps a request identifier to the state needed to resolve it later: the
//! completion channel, the caller's callback, the armed timer and the `done`
//! flag. Every path that can finish a request (worker response, timeout,
//! worker crash, manager kill) goes through [`PendingRequest::mark_done`], so
//! exactly one of them wins.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ExecutionError;
use crate::relay::HostCallback;
use crate::sync::lock;
use crate::timeout::TimerHandle;

/// Outcome of one execution as seen by the caller.
pub type Completion = std::result::Result<Value, ExecutionError>;

/// Identifier of one execution, unique per `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one callback invocation within an execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(String);

impl CallbackId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CallbackId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bookkeeping for one execution that has not resolved yet.
pub struct PendingRequest {
    request_id: RequestId,
    done: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<Completion>>>,
    callback: Option<HostCallback>,
    timer: Mutex<Option<TimerHandle>>,
}

impl PendingRequest {
    pub fn new(
        request_id: RequestId,
        callback: Option<HostCallback>,
        completion: oneshot::Sender<Completion>,
    ) -> Self {
        Self {
            request_id,
            done: AtomicBool::new(false),
            completion: Mutex::new(Some(completion)),
            callback,
            timer: Mutex::new(None),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn callback(&self) -> Option<&HostCallback> {
        self.callback.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Flip `done` from false to true. Returns `true` only for the single caller
    /// that performed the transition.
    pub fn mark_done(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_timer(&self, timer: TimerHandle) {
        *lock(&self.timer) = Some(timer);
    }

    /// Deliver the outcome and disarm the timer. Must only be called by the
    /// winner of [`mark_done`](Self::mark_done).
    pub(crate) fn finish(&self, outcome: Completion) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
        if let Some(tx) = lock(&self.completion).take() {
            // The caller may have dropped its `Execution`; nothing to deliver then.
            let _ = tx.send(outcome);
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_id", &self.request_id)
            .field("done", &self.is_done())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Map of in-flight executions owned by one manager instance.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    entries: Mutex<FxHashMap<RequestId, Arc<PendingRequest>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pending: Arc<PendingRequest>) {
        lock(&self.entries).insert(pending.request_id().clone(), pending);
    }

    pub fn lookup(&self, request_id: &RequestId) -> Option<Arc<PendingRequest>> {
        lock(&self.entries).get(request_id).cloned()
    }

    /// Removing an unknown id is a no-op: late messages from recycled workers
    /// may race with resolution.
    pub fn remove(&self, request_id: &RequestId) -> Option<Arc<PendingRequest>> {
        lock(&self.entries).remove(request_id)
    }

    /// Resolve a request if nothing else resolved it first.
    ///
    /// Returns `false` when the request is unknown or already done; the
    /// outcome is discarded in that case.
    pub fn settle(&self, request_id: &RequestId, outcome: Completion) -> bool {
        let Some(pending) = self.lookup(request_id) else {
            tracing::debug!("Discarding outcome for unknown request {}", request_id);
            return false;
        };
        if !pending.mark_done() {
            tracing::debug!("Discarding late outcome for request {}", request_id);
            return false;
        }
        self.remove(request_id);
        pending.finish(outcome);
        true
    }

    /// Resolve every pending request with the given failure.
    pub fn fail_all(&self, error: ExecutionError) -> usize {
        let drained: Vec<_> = lock(&self.entries).drain().map(|(_, p)| p).collect();
        let mut failed = 0;
        for pending in drained {
            if pending.mark_done() {
                pending.finish(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
