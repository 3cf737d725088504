//! Worker pools, one per isolation backend, behind a uniform contract.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;

use crate::correlation::{Completion, RequestId};
use crate::error::{ProtocolFault, Result};

mod dedicated;
mod servers;
mod threads;

pub use dedicated::DedicatedPool;
pub use servers::ServerPool;
pub use threads::ThreadPool;

/// Which concrete unit serviced a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerId {
    Process(u32),
    Thread(usize),
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(pid) => write!(f, "process {}", pid),
            Self::Thread(index) => write!(f, "thread {}", index),
        }
    }
}

/// Signals that the caller no longer wants a submitted task.
///
/// Set by the timeout governor before it asks the backend to abort, so a
/// task still queued for a worker can be dropped before it ever starts.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of work handed to a pool.
#[derive(Debug, Clone)]
pub struct Task {
    pub request_id: RequestId,
    pub module_path: String,
    pub inputs: Value,
    /// Only the existence of a callback crosses the boundary.
    pub has_callback: bool,
    /// Affinity reservation to run under, if any.
    pub task_id: Option<String>,
    pub cancel: CancelToken,
}

/// Result of a `submit`, with the unit that produced it.
#[derive(Debug)]
pub struct Serviced {
    pub worker: Option<WorkerId>,
    pub outcome: Completion,
}

impl Serviced {
    pub fn unassigned(outcome: Completion) -> Self {
        Self {
            worker: None,
            outcome,
        }
    }
}

/// Uniform contract every isolation backend implements.
///
/// Callback traffic from running scripts is surfaced through the
/// [`CallbackRelay`](crate::relay::CallbackRelay) each backend is built with,
/// not through `submit`.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Provision workers. Resolves once every worker is ready.
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    fn is_started(&self) -> bool;

    /// Run `task` on some worker. The returned future always resolves; worker
    /// failures come back as transport errors in the outcome.
    fn submit(&self, task: Task) -> BoxFuture<'static, Serviced>;

    /// Stop the work for one request, leaving sibling requests alone where
    /// the backend can tell them apart. The task's [`CancelToken`] is already
    /// set when this is called, so work that has not started yet never will.
    fn abort(&self, request_id: &RequestId);

    /// Check that an execution may run under `task_id`. Backends without
    /// reservations ignore the task id.
    fn check_task(&self, _task_id: &str) -> std::result::Result<(), ProtocolFault> {
        Ok(())
    }

    fn reserve(&self, _task_id: &str) -> std::result::Result<(), ProtocolFault> {
        Err(ProtocolFault::ReservationsUnsupported(self.name()))
    }

    fn release(&self, _task_id: &str) -> std::result::Result<(), ProtocolFault> {
        Err(ProtocolFault::ReservationsUnsupported(self.name()))
    }

    /// Terminate every worker. Idempotent.
    fn kill(&self);
}
