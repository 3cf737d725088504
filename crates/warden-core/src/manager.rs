//! Execution facade.
//!
//! [`ScriptManager`] composes the correlation registry, the timeout governor,
//! the callback relay and one worker-pool backend behind a single `execute`
//! operation whose result resolves exactly once.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::{ManagerConfig, ScriptTimeout, Strategy};
use crate::correlation::{Completion, CorrelationRegistry, PendingRequest, RequestId};
use crate::error::{ExecutionError, ProtocolFault, Result};
use crate::pool::{Backend, CancelToken, DedicatedPool, ServerPool, Task, ThreadPool};
use crate::relay::{CallbackRelay, HostCallback, Responder};
use crate::script::ScriptRegistry;
use crate::timeout;

/// Per-execution options.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Module path of the script to run.
    pub module_path: String,
    /// Overrides the manager's default timeout.
    pub timeout: Option<ScriptTimeout>,
    /// Message of the timeout error, instead of the default.
    pub timeout_error_message: Option<String>,
    /// Callback the script may invoke.
    pub callback: Option<HostCallback>,
    /// Affinity reservation to run under.
    pub task_id: Option<String>,
}

impl ExecuteOptions {
    pub fn new(module_path: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: ScriptTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Timeout in milliseconds; `-1` disables it.
    pub fn with_timeout_millis(self, millis: i64) -> Self {
        self.with_timeout(ScriptTimeout::from_millis(millis))
    }

    pub fn with_timeout_error_message(mut self, message: impl Into<String>) -> Self {
        self.timeout_error_message = Some(message.into());
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("module_path", &self.module_path)
            .field("timeout", &self.timeout)
            .field("timeout_error_message", &self.timeout_error_message)
            .field("has_callback", &self.callback.is_some())
            .field("task_id", &self.task_id)
            .finish()
    }
}

/// A running execution. Resolves exactly once.
#[must_use = "an Execution does nothing unless awaited; the script still runs but its result is lost"]
pub struct Execution {
    request_id: RequestId,
    rx: oneshot::Receiver<Completion>,
}

impl Execution {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Future for Execution {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(ExecutionError::transport("execution was abandoned")))
        })
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Handle to an affinity reservation returned by
/// [`ScriptManager::reserve_for_task`].
pub struct TaskReservation {
    task_id: String,
    backend: Arc<dyn Backend>,
    released: AtomicBool,
}

impl TaskReservation {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Release the reservation and its worker. Releasing twice is an error.
    pub fn release(&self) -> std::result::Result<(), ProtocolFault> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(ProtocolFault::AlreadyReleased(self.task_id.clone()));
        }
        self.backend.release(&self.task_id)
    }
}

impl fmt::Debug for TaskReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskReservation")
            .field("task_id", &self.task_id)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Runs scripts in isolation on the configured backend.
///
/// Cheap to clone; all clones share one pool. Dropping the last clone kills
/// the pool.
#[derive(Clone)]
pub struct ScriptManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    registry: Arc<CorrelationRegistry>,
    backend: Arc<dyn Backend>,
    start_lock: tokio::sync::Mutex<()>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.registry
            .fail_all(ExecutionError::transport("script manager was dropped"));
        self.backend.kill();
    }
}

impl ScriptManager {
    /// Create a manager. `scripts` is only consulted by the worker-threads
    /// backend; process backends run the scripts compiled into their worker
    /// executable.
    pub fn new(config: ManagerConfig, scripts: ScriptRegistry) -> Self {
        let registry = Arc::new(CorrelationRegistry::new());
        let relay = Arc::new(CallbackRelay::new(Arc::clone(&registry)));
        let backend: Arc<dyn Backend> = match config.strategy {
            Strategy::DedicatedProcess => Arc::new(DedicatedPool::new(&config, relay)),
            Strategy::HttpServer => Arc::new(ServerPool::new(&config, relay)),
            Strategy::WorkerThreads => Arc::new(ThreadPool::new(&config, scripts, relay)),
        };
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                backend,
                start_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.config.strategy
    }

    /// Provision the pool. Concurrent callers share one start; starting a
    /// running pool is a no-op.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.inner.start_lock.lock().await;
        if self.inner.backend.is_started() {
            tracing::debug!("{} pool already started", self.inner.backend.name());
            return Ok(());
        }
        if let Err(e) = self.inner.backend.start().await {
            tracing::warn!("Failed to start {} pool: {}", self.inner.backend.name(), e);
            self.inner.backend.kill();
            return Err(e);
        }
        Ok(())
    }

    /// Start the pool unless it is already running.
    pub async fn ensure_started(&self) -> Result<()> {
        self.start().await
    }

    pub fn is_started(&self) -> bool {
        self.inner.backend.is_started()
    }

    /// Run a script. Must be called from within a tokio runtime.
    ///
    /// Misuse (pool not started, unknown reservation) is reported here;
    /// everything else resolves through the returned [`Execution`].
    pub fn execute(&self, inputs: Value, options: ExecuteOptions) -> std::result::Result<Execution, ProtocolFault> {
        let inner = &self.inner;
        if !inner.backend.is_started() {
            return Err(ProtocolFault::NotStarted);
        }
        if let Some(task_id) = &options.task_id {
            inner.backend.check_task(task_id)?;
        }

        let request_id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        let has_callback = options.callback.is_some();
        let pending = Arc::new(PendingRequest::new(request_id.clone(), options.callback, tx));
        inner.registry.register(Arc::clone(&pending));

        let limit = options.timeout.unwrap_or(inner.config.timeout);
        let message = options.timeout_error_message;
        let cancel = CancelToken::new();
        let registry = Arc::clone(&inner.registry);
        let backend = Arc::clone(&inner.backend);
        let on_timeout = cancel.clone();
        let timer = timeout::arm(&pending, limit, move |pending| {
            registry.remove(pending.request_id());
            on_timeout.cancel();
            backend.abort(pending.request_id());
            pending.finish(Err(ExecutionError::timeout(message)));
        });
        if let Some(timer) = timer {
            pending.set_timer(timer);
        }

        tracing::debug!(
            "Executing {} as request {} on {} pool",
            options.module_path,
            request_id,
            inner.backend.name()
        );
        let submitted = inner.backend.submit(Task {
            request_id: request_id.clone(),
            module_path: options.module_path,
            inputs,
            has_callback,
            task_id: options.task_id,
            cancel,
        });

        let registry = Arc::clone(&inner.registry);
        let settled_id = request_id.clone();
        tokio::spawn(async move {
            let serviced = submitted.await;
            if let Some(worker) = serviced.worker {
                tracing::debug!("Request {} serviced by {}", settled_id, worker);
            }
            if let Err(e) = &serviced.outcome {
                if e.is_transport() {
                    tracing::warn!("Request {} failed in transport: {}", settled_id, e);
                }
            }
            registry.settle(&settled_id, serviced.outcome);
        });

        Ok(Execution { request_id, rx })
    }

    /// Completion-closure form of [`execute`](Self::execute).
    pub fn execute_with<F>(
        &self,
        inputs: Value,
        options: ExecuteOptions,
        completion: F,
    ) -> std::result::Result<RequestId, ProtocolFault>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let execution = self.execute(inputs, options)?;
        let request_id = execution.request_id().clone();
        tokio::spawn(async move {
            completion(execution.await);
        });
        Ok(request_id)
    }

    /// Reserve `task_id` so executions carrying it share one worker.
    pub fn reserve_for_task(&self, task_id: impl Into<String>) -> std::result::Result<TaskReservation, ProtocolFault> {
        let task_id = task_id.into();
        self.inner.backend.reserve(&task_id)?;
        Ok(TaskReservation {
            task_id,
            backend: Arc::clone(&self.inner.backend),
            released: AtomicBool::new(false),
        })
    }

    /// Number of executions that have not resolved yet.
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    /// Fail every pending execution and terminate all workers. Idempotent.
    pub fn kill(&self) {
        let failed = self
            .inner
            .registry
            .fail_all(ExecutionError::transport("script manager was killed"));
        if failed > 0 {
            tracing::info!("Killed script manager with {} pending executions", failed);
        }
        self.inner.backend.kill();
    }
}

impl fmt::Debug for ScriptManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptManager")
            .field("strategy", &self.inner.config.strategy)
            .field("started", &self.is_started())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}
