//! Subprocess pool behind an internal HTTP endpoint.
//!
//! A fixed number of long-lived workers each serve many executions at once
//! over HTTP, while callbacks and bookkeeping (`Register`, `Completed`) flow
//! over each worker's stdio. The host is the front controller: it assigns
//! requests round-robin, remembers which worker services which request so a
//! timeout can kill the right process, and respawns workers that exit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use rustc_hash::FxHashMap;
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, oneshot};

use crate::config::ManagerConfig;
use crate::correlation::{Completion, RequestId};
use crate::error::{Error, ExecutionError, Result};
use crate::ipc::protocol::{DataReply, ErrorReply, ExecuteBody, ExecuteBodyOptions, HostMessage, WorkerMessage};
use crate::ipc::{WorkerKillHandle, WorkerProcess, find_worker_binary, read_frame, write_frame};
use crate::relay::CallbackRelay;
use crate::sync::lock;
use crate::worker::WorkerMode;

use super::dedicated::{dispatch_callback, reply_route};
use super::{Backend, Serviced, Task, WorkerId};

/// Message for responses that cannot be read at all.
pub const COMMUNICATION_ERROR: &str =
    "Something went wrong in communication with internal scripting server";

/// Pause before replacing a worker that exited, so a worker that dies on
/// startup does not spin.
const RESPAWN_DELAY: Duration = Duration::from_millis(50);

/// How long a worker asked to shut down may take before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub struct ServerPool {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    explicit_program: Option<PathBuf>,
    program: Mutex<Option<PathBuf>>,
    worker_args: Vec<String>,
    num_workers: usize,
    host: String,
    input_request_limit: Option<usize>,
    startup_timeout: Duration,
    /// Fresh for every start; workers reject requests tagged otherwise.
    generation: AtomicU64,
    /// Bumped by every start and kill. Supervisors only respawn or publish
    /// workers while their epoch is current.
    epoch: AtomicU64,
    relay: Arc<CallbackRelay>,
    client: reqwest::Client,
    /// Workers that reported `Listening`.
    workers: Mutex<Vec<ServerWorker>>,
    next: AtomicUsize,
    /// Which worker pid services which request.
    assignments: Mutex<FxHashMap<RequestId, u32>>,
    started: AtomicBool,
    killed: AtomicBool,
}

#[derive(Clone)]
struct ServerWorker {
    pid: u32,
    port: u16,
    kill: WorkerKillHandle,
    tx: mpsc::UnboundedSender<HostMessage>,
}

impl ServerWorker {
    /// Ask the worker to stop, killing it if it is still around after the grace period.
    fn shut_down(self) {
        if self.tx.send(HostMessage::Shutdown).is_err() {
            self.kill.kill();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                    self.kill.kill();
                });
            }
            Err(_) => self.kill.kill(),
        }
    }
}

fn fresh_generation() -> u64 {
    uuid::Uuid::new_v4().as_u64_pair().0
}

impl ServerPool {
    pub fn new(config: &ManagerConfig, relay: Arc<CallbackRelay>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                explicit_program: config.worker_program.clone(),
                program: Mutex::new(None),
                worker_args: config.worker_args.clone(),
                num_workers: config.num_workers.max(1),
                host: config.host.clone(),
                input_request_limit: config.input_request_limit,
                startup_timeout: config.startup_timeout,
                generation: AtomicU64::new(fresh_generation()),
                epoch: AtomicU64::new(0),
                relay,
                client: reqwest::Client::new(),
                workers: Mutex::new(Vec::new()),
                next: AtomicUsize::new(0),
                assignments: Mutex::new(FxHashMap::default()),
                started: AtomicBool::new(false),
                killed: AtomicBool::new(false),
            }),
        }
    }

    /// Generation tag every request to this pool's workers must carry.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Number of workers currently accepting requests.
    pub fn live_workers(&self) -> usize {
        lock(&self.inner.workers).len()
    }
}

impl Backend for ServerPool {
    fn name(&self) -> &'static str {
        "http-server"
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let inner = &self.inner;
            let program = find_worker_binary(inner.explicit_program.as_deref())?;
            *lock(&inner.program) = Some(program);
            let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            inner.generation.store(fresh_generation(), Ordering::SeqCst);
            inner.killed.store(false, Ordering::SeqCst);

            let mut ready = Vec::with_capacity(inner.num_workers);
            for _ in 0..inner.num_workers {
                ready.push(inner.spawn_worker(epoch)?);
            }

            let all_ready = futures::future::join_all(ready);
            let results = tokio::time::timeout(inner.startup_timeout, all_ready)
                .await
                .map_err(|_| Error::StartupTimeout(inner.startup_timeout))?;
            for result in results {
                result.map_err(|_| Error::Spawn("worker exited before listening".to_string()))?;
            }

            inner.started.store(true, Ordering::SeqCst);
            tracing::info!(
                "HTTP server pool started with {} workers (generation {})",
                inner.num_workers,
                inner.generation.load(Ordering::SeqCst)
            );
            Ok(())
        })
    }

    fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.killed.load(Ordering::SeqCst)
    }

    fn submit(&self, task: Task) -> BoxFuture<'static, Serviced> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.run(task).await })
    }

    fn abort(&self, request_id: &RequestId) {
        let Some(pid) = lock(&self.inner.assignments).remove(request_id) else {
            return;
        };
        let worker = lock(&self.inner.workers).iter().find(|w| w.pid == pid).cloned();
        if let Some(worker) = worker {
            tracing::debug!("Killing worker {} servicing request {}", pid, request_id);
            worker.kill.kill();
        }
    }

    fn kill(&self) {
        let inner = &self.inner;
        inner.killed.store(true, Ordering::SeqCst);
        inner.started.store(false, Ordering::SeqCst);
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        let workers: Vec<_> = lock(&inner.workers).drain(..).collect();
        for worker in workers {
            tracing::debug!("Shutting down worker {}", worker.pid);
            worker.shut_down();
        }
        lock(&inner.assignments).clear();
    }
}

impl ServerInner {
    /// Spawn one worker and its supervisor task. The returned receiver fires
    /// once the worker is listening.
    fn spawn_worker(self: &Arc<Self>, epoch: u64) -> Result<oneshot::Receiver<()>> {
        let program = lock(&self.program)
            .clone()
            .ok_or_else(|| Error::Spawn("worker program is not resolved".to_string()))?;
        let worker = WorkerProcess::spawn(&program, WorkerMode::Server.as_str(), &self.worker_args)?;
        let pid = worker.pid();
        let kill = worker.kill_handle();
        let (child, mut stdin, stdout) = worker.into_parts();

        let (tx, mut rx) = mpsc::unbounded_channel::<HostMessage>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_frame(&mut stdin, &message).await {
                    tracing::debug!("Stopped writing to worker {}: {}", pid, e);
                    break;
                }
            }
        });

        let limit = self.input_request_limit.map(|l| l as i64).unwrap_or(-1);
        tx.send(HostMessage::Start {
            generation: self.generation.load(Ordering::SeqCst),
            host: self.host.clone(),
            input_request_limit: limit,
        })
        .map_err(|_| Error::Ipc("worker channel closed before Start".to_string()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.supervise(epoch, child, stdout, tx, kill, ready_tx).await;
        });
        Ok(ready_rx)
    }

    /// Pump one worker's stdio until it exits, then clean up and respawn.
    async fn supervise(
        self: Arc<Self>,
        epoch: u64,
        mut child: Child,
        mut stdout: ChildStdout,
        tx: mpsc::UnboundedSender<HostMessage>,
        kill: WorkerKillHandle,
        ready: oneshot::Sender<()>,
    ) {
        let pid = kill.pid();
        let route = reply_route(tx.downgrade());
        let mut ready = Some(ready);

        loop {
            match read_frame::<_, WorkerMessage>(&mut stdout).await {
                Ok(Some(WorkerMessage::Listening { port, pid: reported })) => {
                    tracing::debug!("Worker {} listening on port {}", reported, port);
                    // Checked under the lock so a concurrent kill either drains
                    // this worker or is seen here.
                    let published = {
                        let mut workers = lock(&self.workers);
                        let current = self.is_current(epoch);
                        if current {
                            workers.push(ServerWorker {
                                pid,
                                port,
                                kill: kill.clone(),
                                tx: tx.clone(),
                            });
                        }
                        current
                    };
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                    if !published {
                        tracing::debug!("Worker {} belongs to a stopped pool; killing it", pid);
                        kill.kill();
                    }
                }
                Ok(Some(WorkerMessage::Register { request_id, .. })) => {
                    lock(&self.assignments).insert(RequestId::from(request_id), pid);
                }
                Ok(Some(WorkerMessage::Completed { request_id })) => {
                    lock(&self.assignments).remove(&RequestId::from(request_id));
                }
                Ok(Some(WorkerMessage::Callback {
                    request_id,
                    callback_id,
                    args_json,
                })) => dispatch_callback(&self.relay, &route, request_id, callback_id, &args_json),
                Ok(Some(other)) => tracing::debug!("Ignoring {:?} from worker {}", other, pid),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Lost channel to worker {}: {}", pid, e);
                    break;
                }
            }
        }

        drop(tx);
        kill.kill();
        match child.wait().await {
            Ok(status) => tracing::debug!("Worker {} exited with {}", pid, status),
            Err(e) => tracing::debug!("Failed to wait for worker {}: {}", pid, e),
        }

        lock(&self.workers).retain(|w| w.pid != pid);
        // In-flight HTTP requests to this worker fail on their own.
        let dropped = {
            let mut assignments = lock(&self.assignments);
            let before = assignments.len();
            assignments.retain(|_, assigned| *assigned != pid);
            before - assignments.len()
        };

        if !self.is_current(epoch) {
            return;
        }
        tracing::warn!(
            "Worker {} exited with {} request(s) in flight; spawning a replacement",
            pid,
            dropped
        );

        tokio::time::sleep(RESPAWN_DELAY).await;
        if !self.is_current(epoch) {
            return;
        }
        if let Err(e) = self.spawn_worker(epoch) {
            tracing::warn!("Failed to respawn worker: {}", e);
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.killed.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn pick(&self) -> Option<ServerWorker> {
        let workers = lock(&self.workers);
        if workers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Some(workers[index].clone())
    }

    async fn run(&self, task: Task) -> Serviced {
        if self.killed.load(Ordering::SeqCst) {
            return Serviced::unassigned(Err(ExecutionError::transport(
                "http-server pool was killed",
            )));
        }
        let Some(worker) = self.pick() else {
            return Serviced::unassigned(Err(ExecutionError::transport(
                "No internal scripting server is available",
            )));
        };

        let body = ExecuteBody {
            inputs: task.inputs,
            options: ExecuteBodyOptions {
                request_id: task.request_id.to_string(),
                module_path: task.module_path,
                has_callback: task.has_callback,
                generation: self.generation.load(Ordering::SeqCst),
            },
        };
        let bytes = match serde_json::to_vec(&body) {
            Ok(bytes) => bytes,
            Err(e) => return Serviced::unassigned(Err(ExecutionError::untransferable(e))),
        };

        // Assigning under the lock orders it against `abort`: either abort
        // finds the assignment, or the token is already set here.
        {
            let mut assignments = lock(&self.assignments);
            if task.cancel.is_cancelled() {
                return Serviced::unassigned(Err(ExecutionError::transport(
                    "request was cancelled before it was sent to a worker",
                )));
            }
            assignments.insert(task.request_id.clone(), worker.pid);
        }
        tracing::debug!("Request {} assigned to worker {}", task.request_id, worker.pid);

        let outcome = self.post(&worker, bytes).await;

        lock(&self.assignments).remove(&task.request_id);
        Serviced {
            worker: Some(WorkerId::Process(worker.pid)),
            outcome,
        }
    }

    async fn post(&self, worker: &ServerWorker, body: Vec<u8>) -> Completion {
        let url = format!("http://{}:{}/", self.host, worker.port);
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                ExecutionError::transport(format!(
                    "Error when connecting to internal scripting server: {}",
                    e
                ))
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            ExecutionError::transport(format!(
                "Error when reading response of internal scripting server: {}",
                e
            ))
        })?;
        map_response(status, &bytes, self.input_request_limit)
    }
}

/// Interpret a worker's HTTP response.
fn map_response(status: StatusCode, body: &[u8], limit: Option<usize>) -> Completion {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        let limit = limit.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string());
        return Err(ExecutionError::transport(format!(
            "Input request exceeded the configured limit of {} bytes",
            limit
        )));
    }
    if body.is_empty() {
        return Err(ExecutionError::transport(COMMUNICATION_ERROR));
    }

    match status {
        StatusCode::OK => serde_json::from_slice::<DataReply>(body)
            .map(|reply| reply.data)
            .map_err(ExecutionError::untransferable),
        StatusCode::INTERNAL_SERVER_ERROR => match serde_json::from_slice::<ErrorReply>(body) {
            Ok(reply) => Err(ExecutionError::script(reply.error.message, reply.error.stack)),
            Err(_) => Err(ExecutionError::transport(COMMUNICATION_ERROR)),
        },
        StatusCode::BAD_REQUEST => {
            let message = serde_json::from_slice::<ErrorReply>(body)
                .map(|reply| reply.error.message)
                .unwrap_or_else(|_| crate::ProtocolFault::BadRequest.to_string());
            Err(ExecutionError::transport(message))
        }
        other => Err(ExecutionError::transport(format!(
            "Unexpected status {} from internal scripting server",
            other
        ))),
    }
}
