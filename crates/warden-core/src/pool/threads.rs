//! Thread-pool backend.
//!
//! A fixed set of OS threads, each driving its own current-thread tokio
//! runtime. Work reaches a thread through a *session*: a pair of channels
//! opened for one execution (or one affinity reservation) and closed when it
//! ends. Callback traffic for a session never mixes with another session's.
//! Aborting a request aborts just its task inside the session; sibling work
//! on the same thread keeps running.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};

use crate::affinity::ReservationTable;
use crate::config::ManagerConfig;
use crate::correlation::{CallbackId, Completion, RequestId};
use crate::error::{Error, ExecutionError, ProtocolFault, Result};
use crate::relay::{CallbackRelay, CallbackReply, CallbackRequest, ReplyRoute};
use crate::script::{CallbackSink, CallbackTable, HostHandle, ScriptFault, ScriptRegistry};
use crate::sync::lock;
use crate::worker::run_script;

use super::{Backend, CancelToken, Serviced, Task, WorkerId};

/// Host → thread, within one session.
enum SessionMessage {
    Execute {
        request_id: RequestId,
        module_path: String,
        inputs: Value,
        has_callback: bool,
        reply: oneshot::Sender<std::result::Result<Value, ScriptFault>>,
    },
    CallbackResponse {
        callback_id: CallbackId,
        reply: CallbackReply,
    },
    Abort {
        request_id: RequestId,
    },
}

/// Thread → host, within one session.
enum SessionEvent {
    Callback {
        request_id: RequestId,
        callback_id: CallbackId,
        args: Vec<Value>,
    },
}

/// Channels a worker thread serves until the host closes them.
struct OpenSession {
    messages: mpsc::UnboundedReceiver<SessionMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

struct WorkerThread {
    commands: mpsc::UnboundedSender<OpenSession>,
    _thread: JoinHandle<()>,
}

pub struct ThreadPool {
    inner: Arc<ThreadInner>,
}

struct ThreadInner {
    num_workers: usize,
    registry: Arc<ScriptRegistry>,
    relay: Arc<CallbackRelay>,
    threads: Mutex<Vec<Option<WorkerThread>>>,
    idle: Mutex<VecDeque<usize>>,
    permits: Mutex<Arc<Semaphore>>,
    reservations: ReservationTable<Arc<Session>>,
    /// Session carrying each in-flight request, for selective abort.
    inflight: Mutex<FxHashMap<RequestId, mpsc::WeakUnboundedSender<SessionMessage>>>,
    started: AtomicBool,
    /// Bumped by every start and kill; sessions only return their worker to
    /// the idle set of the epoch that lent it.
    epoch: AtomicU64,
}

/// Host side of an open session. Dropping it closes the channels and hands
/// the worker back to the pool.
struct Session {
    worker: usize,
    epoch: u64,
    messages: mpsc::UnboundedSender<SessionMessage>,
    pump: tokio::task::JoinHandle<()>,
    pool: Weak<ThreadInner>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(pool) = self.pool.upgrade() {
            let mut idle = lock(&pool.idle);
            if pool.epoch.load(Ordering::SeqCst) == self.epoch {
                idle.push_back(self.worker);
            } else {
                tracing::debug!(
                    "Not returning worker thread {} from a previous pool start",
                    self.worker
                );
            }
        }
        // The permit is released after this, once the worker is back in `idle`.
    }
}

impl ThreadPool {
    pub fn new(config: &ManagerConfig, registry: ScriptRegistry, relay: Arc<CallbackRelay>) -> Self {
        let num_workers = config.num_workers.max(1);
        Self {
            inner: Arc::new(ThreadInner {
                num_workers,
                registry: Arc::new(registry),
                relay,
                threads: Mutex::new(Vec::new()),
                idle: Mutex::new(VecDeque::new()),
                permits: Mutex::new(Arc::new(Semaphore::new(0))),
                reservations: ReservationTable::new(),
                inflight: Mutex::new(FxHashMap::default()),
                started: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Number of workers not serving a session.
    pub fn idle_workers(&self) -> usize {
        lock(&self.inner.idle).len()
    }
}

impl Backend for ThreadPool {
    fn name(&self) -> &'static str {
        "worker-threads"
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let inner = &self.inner;
            let mut threads = Vec::with_capacity(inner.num_workers);
            let mut ready = Vec::with_capacity(inner.num_workers);
            for index in 0..inner.num_workers {
                let (thread, started) = spawn_thread(index, Arc::clone(&inner.registry))?;
                threads.push(Some(thread));
                ready.push(started);
            }
            for started in ready {
                started
                    .await
                    .map_err(|_| Error::Spawn("worker thread exited during startup".to_string()))??;
            }

            *lock(&inner.threads) = threads;
            {
                let mut idle = lock(&inner.idle);
                inner.epoch.fetch_add(1, Ordering::SeqCst);
                *idle = (0..inner.num_workers).collect();
            }
            *lock(&inner.permits) = Arc::new(Semaphore::new(inner.num_workers));
            inner.started.store(true, Ordering::SeqCst);
            tracing::info!("Thread pool started with {} workers", inner.num_workers);
            Ok(())
        })
    }

    fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    fn submit(&self, task: Task) -> BoxFuture<'static, Serviced> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.run(task).await })
    }

    fn abort(&self, request_id: &RequestId) {
        let Some(session) = lock(&self.inner.inflight).remove(request_id) else {
            return;
        };
        if let Some(tx) = session.upgrade() {
            tracing::debug!("Aborting request {} in its worker thread", request_id);
            let _ = tx.send(SessionMessage::Abort {
                request_id: request_id.clone(),
            });
        }
    }

    fn check_task(&self, task_id: &str) -> std::result::Result<(), ProtocolFault> {
        if self.inner.reservations.contains(task_id) {
            Ok(())
        } else {
            Err(ProtocolFault::ReservationNotFound(task_id.to_string()))
        }
    }

    fn reserve(&self, task_id: &str) -> std::result::Result<(), ProtocolFault> {
        self.inner.reservations.reserve(task_id)
    }

    fn release(&self, task_id: &str) -> std::result::Result<(), ProtocolFault> {
        self.inner.reservations.release(task_id)
    }

    fn kill(&self) {
        let inner = &self.inner;
        inner.started.store(false, Ordering::SeqCst);
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&inner.permits).close();
        inner.reservations.clear();

        let inflight: Vec<_> = lock(&inner.inflight).drain().collect();
        for (request_id, session) in inflight {
            if let Some(tx) = session.upgrade() {
                let _ = tx.send(SessionMessage::Abort { request_id });
            }
        }

        // Threads exit once their command channel closes and their current
        // session ends.
        lock(&inner.threads).clear();
        lock(&inner.idle).clear();
    }
}

impl ThreadInner {
    async fn run(self: &Arc<Self>, task: Task) -> Serviced {
        let session = match &task.task_id {
            Some(task_id) => {
                let Some(reservation) = self.reservations.get(task_id) else {
                    return Serviced::unassigned(Err(ExecutionError::transport(format!(
                        "reservation for task {} was released",
                        task_id
                    ))));
                };
                let cancel = &task.cancel;
                match reservation
                    .bind_with(|| async { self.open_session(cancel).await.map(Arc::new) })
                    .await
                {
                    Ok(session) => Arc::clone(session),
                    Err(e) => return Serviced::unassigned(Err(e)),
                }
            }
            None => match self.open_session(&task.cancel).await {
                Ok(session) => Arc::new(session),
                Err(e) => return Serviced::unassigned(Err(e)),
            },
        };

        let worker = Some(WorkerId::Thread(session.worker));
        let outcome = self.execute_on(&session, task).await;
        Serviced { worker, outcome }
    }

    async fn execute_on(&self, session: &Session, task: Task) -> Completion {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = task.request_id.clone();

        // Checking the token and sending under the `inflight` lock orders the
        // send against `abort`: either abort sees the entry, or we see the token.
        let sent = {
            let mut inflight = lock(&self.inflight);
            if task.cancel.is_cancelled() {
                return Err(cancelled());
            }
            let sent = session.messages.send(SessionMessage::Execute {
                request_id: task.request_id,
                module_path: task.module_path,
                inputs: task.inputs,
                has_callback: task.has_callback,
                reply: reply_tx,
            });
            inflight.insert(request_id.clone(), session.messages.downgrade());
            sent
        };

        let outcome = if sent.is_err() {
            Err(ExecutionError::transport("worker thread is gone"))
        } else {
            match reply_rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(fault)) => Err(ExecutionError::script(fault.message, fault.stack)),
                Err(_) => Err(ExecutionError::transport(
                    "worker thread stopped before responding",
                )),
            }
        };

        lock(&self.inflight).remove(&request_id);
        outcome
    }

    /// Wait for a free worker and open a session on it.
    /// Gives up without taking a worker once `cancel` is set.
    async fn open_session(
        self: &Arc<Self>,
        cancel: &CancelToken,
    ) -> std::result::Result<Session, ExecutionError> {
        let permits = Arc::clone(&lock(&self.permits));
        let epoch = self.epoch.load(Ordering::SeqCst);
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            permit = permits.acquire_owned() => {
                permit.map_err(|_| ExecutionError::transport("thread pool was killed"))?
            }
        };
        let worker = lock(&self.idle)
            .pop_front()
            .ok_or_else(|| ExecutionError::transport("no idle worker thread"))?;

        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let open = OpenSession {
            messages: messages_rx,
            events: events_tx,
        };

        if let Err(e) = self.hand_over(worker, open) {
            lock(&self.idle).push_back(worker);
            return Err(ExecutionError::transport(e.to_string()));
        }

        let pump = tokio::spawn(pump_events(
            Arc::clone(&self.relay),
            events_rx,
            messages_tx.downgrade(),
        ));
        tracing::debug!("Opened session on worker thread {}", worker);

        Ok(Session {
            worker,
            epoch,
            messages: messages_tx,
            pump,
            pool: Arc::downgrade(self),
            _permit: Some(permit),
        })
    }

    /// Give a session to worker `index`, respawning the thread if it died.
    fn hand_over(&self, index: usize, open: OpenSession) -> Result<()> {
        let mut threads = lock(&self.threads);
        let slot = threads
            .get_mut(index)
            .ok_or_else(|| Error::Spawn(format!("no worker thread {}", index)))?;

        let open = match slot.as_ref().map(|t| t.commands.send(open)) {
            Some(Ok(())) => return Ok(()),
            Some(Err(mpsc::error::SendError(open))) => open,
            None => return Err(Error::Spawn("thread pool was killed".to_string())),
        };

        tracing::warn!("Worker thread {} died; spawning a replacement", index);
        let (thread, _started) = spawn_thread(index, Arc::clone(&self.registry))?;
        thread
            .commands
            .send(open)
            .map_err(|_| Error::Spawn(format!("replacement worker thread {} is gone", index)))?;
        *slot = Some(thread);
        Ok(())
    }
}

fn cancelled() -> ExecutionError {
    ExecutionError::transport("request was cancelled before it reached a worker")
}

/// Relay a session's callback events to the host callback.
async fn pump_events(
    relay: Arc<CallbackRelay>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    messages: mpsc::WeakUnboundedSender<SessionMessage>,
) {
    while let Some(SessionEvent::Callback {
        request_id,
        callback_id,
        args,
    }) = events.recv().await
    {
        let messages = messages.clone();
        let route: ReplyRoute = Arc::new(move |_: RequestId, callback_id: CallbackId, reply: CallbackReply| {
            if let Some(tx) = messages.upgrade() {
                let _ = tx.send(SessionMessage::CallbackResponse { callback_id, reply });
            }
        });
        relay.dispatch(
            CallbackRequest {
                request_id,
                callback_id,
                args,
            },
            route,
        );
    }
}

/// Sends callback requests from scripts on a worker thread to the host.
struct EventSink {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl CallbackSink for EventSink {
    fn send_callback(&self, request_id: &RequestId, callback_id: &CallbackId, args: Vec<Value>) -> bool {
        self.events
            .send(SessionEvent::Callback {
                request_id: request_id.clone(),
                callback_id: callback_id.clone(),
                args,
            })
            .is_ok()
    }
}

type Started = oneshot::Receiver<Result<()>>;

fn spawn_thread(index: usize, registry: Arc<ScriptRegistry>) -> Result<(WorkerThread, Started)> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (started_tx, started_rx) = oneshot::channel();

    let thread = std::thread::Builder::new()
        .name(format!("warden-worker-{}", index))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = started_tx.send(Err(Error::Spawn(format!(
                        "failed to build runtime for worker thread {}: {}",
                        index, e
                    ))));
                    return;
                }
            };
            let _ = started_tx.send(Ok(()));
            tracing::debug!("Worker thread {} started", index);
            runtime.block_on(serve_sessions(commands_rx, registry));
            tracing::debug!("Worker thread {} stopped", index);
        })
        .map_err(|e| Error::Spawn(format!("failed to spawn worker thread {}: {}", index, e)))?;

    Ok((
        WorkerThread {
            commands: commands_tx,
            _thread: thread,
        },
        started_rx,
    ))
}

/// Worker thread main loop: serve one session at a time.
async fn serve_sessions(mut commands: mpsc::UnboundedReceiver<OpenSession>, registry: Arc<ScriptRegistry>) {
    while let Some(session) = commands.recv().await {
        serve_session(session, &registry).await;
    }
}

async fn serve_session(session: OpenSession, registry: &Arc<ScriptRegistry>) {
    let OpenSession { mut messages, events } = session;
    let table = Arc::new(CallbackTable::new());
    let sink: Arc<dyn CallbackSink> = Arc::new(EventSink { events });
    let mut tasks: JoinSet<RequestId> = JoinSet::new();
    let mut running: FxHashMap<RequestId, AbortHandle> = FxHashMap::default();

    loop {
        tokio::select! {
            message = messages.recv() => match message {
                None => break,
                Some(SessionMessage::Execute { request_id, module_path, inputs, has_callback, reply }) => {
                    let host = HostHandle::new(
                        request_id.clone(),
                        has_callback,
                        Arc::clone(&table),
                        Arc::clone(&sink),
                    );
                    let registry = Arc::clone(registry);
                    let id = request_id.clone();
                    let handle = tasks.spawn(async move {
                        let outcome = run_script(&registry, &module_path, inputs, host).await;
                        let _ = reply.send(outcome);
                        id
                    });
                    running.insert(request_id, handle);
                }
                Some(SessionMessage::CallbackResponse { callback_id, reply }) => {
                    if !table.resolve(&callback_id, reply) {
                        tracing::debug!("Dropping response for unknown callback {}", callback_id);
                    }
                }
                Some(SessionMessage::Abort { request_id }) => {
                    if let Some(handle) = running.remove(&request_id) {
                        handle.abort();
                        table.close_request(&request_id);
                    }
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Ok(request_id) = joined {
                    running.remove(&request_id);
                }
            }
        }
    }

    // Session closed: anything still running was abandoned by the host.
    tasks.abort_all();
}
