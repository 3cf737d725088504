//! Subprocess-per-call backend.
//!
//! Every `submit` spawns a fresh worker in dedicated mode, sends it one
//! `Execute`, relays its callbacks, and reaps it once it answers. The strongest
//! isolation the crate offers, at the cost of a process spawn per call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use tokio::process::{Child, ChildStdout};
use tokio::sync::mpsc;

use crate::config::ManagerConfig;
use crate::correlation::{CallbackId, Completion, RequestId};
use crate::error::{ExecutionError, Result};
use crate::ipc::protocol::{HostMessage, MAX_FRAME_LEN, WorkerMessage, decode_values, encode_values};
use crate::ipc::{WorkerKillHandle, WorkerProcess, find_worker_binary, read_frame, write_frame};
use crate::relay::{CallbackRelay, CallbackReply, CallbackRequest, ReplyRoute};
use crate::sync::lock;
use crate::worker::WorkerMode;

use serde_json::Value;

use super::{Backend, Serviced, Task, WorkerId};

/// How long a worker that already answered may take to exit on its own.
const REAP_GRACE: Duration = Duration::from_secs(2);

pub struct DedicatedPool {
    inner: Arc<DedicatedInner>,
}

struct DedicatedInner {
    explicit_program: Option<PathBuf>,
    program: OnceLock<PathBuf>,
    worker_args: Vec<String>,
    relay: Arc<CallbackRelay>,
    running: Mutex<FxHashMap<RequestId, WorkerKillHandle>>,
    killed: AtomicBool,
}

impl DedicatedPool {
    pub fn new(config: &ManagerConfig, relay: Arc<CallbackRelay>) -> Self {
        Self {
            inner: Arc::new(DedicatedInner {
                explicit_program: config.worker_program.clone(),
                program: OnceLock::new(),
                worker_args: config.worker_args.clone(),
                relay,
                running: Mutex::new(FxHashMap::default()),
                killed: AtomicBool::new(false),
            }),
        }
    }
}

impl Backend for DedicatedPool {
    fn name(&self) -> &'static str {
        "dedicated-process"
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.inner.program.get().is_none() {
                let program = find_worker_binary(self.inner.explicit_program.as_deref())?;
                tracing::info!("Dedicated-process pool using worker {}", program.display());
                let _ = self.inner.program.set(program);
            }
            self.inner.killed.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_started(&self) -> bool {
        self.inner.program.get().is_some() && !self.inner.killed.load(Ordering::SeqCst)
    }

    fn submit(&self, task: Task) -> BoxFuture<'static, Serviced> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.run(task).await })
    }

    fn abort(&self, request_id: &RequestId) {
        if let Some(handle) = lock(&self.inner.running).get(request_id) {
            tracing::debug!("Killing worker {} for request {}", handle.pid(), request_id);
            handle.kill();
        }
    }

    fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        let running: Vec<_> = lock(&self.inner.running).drain().map(|(_, h)| h).collect();
        for handle in running {
            handle.kill();
        }
    }
}

impl DedicatedInner {
    async fn run(&self, task: Task) -> Serviced {
        let Some(program) = self.program.get() else {
            return Serviced::unassigned(Err(ExecutionError::transport(
                "dedicated-process pool is not started",
            )));
        };
        if self.killed.load(Ordering::SeqCst) {
            return Serviced::unassigned(Err(ExecutionError::transport(
                "dedicated-process pool was killed",
            )));
        }

        let inputs_json = match encode_inputs(&task.inputs, MAX_FRAME_LEN) {
            Ok(bytes) => bytes,
            Err(e) => return Serviced::unassigned(Err(e)),
        };

        // Spawning under the `running` lock orders it against `abort`: either
        // abort finds the kill handle, or the token is already set here.
        let worker = {
            let mut running = lock(&self.running);
            if task.cancel.is_cancelled() {
                return Serviced::unassigned(Err(ExecutionError::transport(
                    "request was cancelled before a worker was spawned",
                )));
            }
            let worker = match WorkerProcess::spawn(program, WorkerMode::Dedicated.as_str(), &self.worker_args) {
                Ok(worker) => worker,
                Err(e) => return Serviced::unassigned(Err(ExecutionError::transport(e.to_string()))),
            };
            running.insert(task.request_id.clone(), worker.kill_handle());
            worker
        };
        let pid = worker.pid();

        let message = HostMessage::Execute {
            request_id: task.request_id.to_string(),
            module_path: task.module_path,
            inputs_json,
            has_callback: task.has_callback,
        };
        let outcome = self.drive(worker, message).await;

        lock(&self.running).remove(&task.request_id);
        Serviced {
            worker: Some(WorkerId::Process(pid)),
            outcome,
        }
    }

    /// Send the execute message and pump worker messages until it answers or dies.
    async fn drive(&self, worker: WorkerProcess, message: HostMessage) -> Completion {
        let (child, mut stdin, mut stdout) = worker.into_parts();

        let (tx, mut rx) = mpsc::unbounded_channel::<HostMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_frame(&mut stdin, &message).await {
                    tracing::debug!("Stopped writing to dedicated worker: {}", e);
                    break;
                }
            }
        });

        let outcome = if tx.send(message).is_err() {
            Err(ExecutionError::transport("worker process channel closed"))
        } else {
            self.pump(&mut stdout, &tx).await
        };

        drop(tx);
        writer.abort();
        reap(child);
        outcome
    }

    async fn pump(&self, stdout: &mut ChildStdout, tx: &mpsc::UnboundedSender<HostMessage>) -> Completion {
        let route = reply_route(tx.downgrade());

        loop {
            match read_frame::<_, WorkerMessage>(stdout).await {
                Ok(Some(WorkerMessage::ExecuteResponse { outcome, .. })) => {
                    return outcome.into_completion();
                }
                Ok(Some(WorkerMessage::Callback {
                    request_id,
                    callback_id,
                    args_json,
                })) => dispatch_callback(&self.relay, &route, request_id, callback_id, &args_json),
                Ok(Some(other)) => {
                    tracing::debug!("Ignoring {:?} from dedicated worker", other);
                }
                Ok(None) => {
                    return Err(ExecutionError::transport(
                        "worker process exited before responding",
                    ));
                }
                Err(e) => {
                    return Err(ExecutionError::transport(format!(
                        "worker process channel failed: {}",
                        e
                    )));
                }
            }
        }
    }
}

/// Serialize execution inputs, refusing anything that would not fit in a frame.
pub(super) fn encode_inputs(inputs: &Value, limit: usize) -> std::result::Result<Vec<u8>, ExecutionError> {
    let bytes = serde_json::to_vec(inputs).map_err(ExecutionError::untransferable)?;
    if bytes.len() > limit {
        return Err(ExecutionError::untransferable(format!(
            "inputs are {} bytes (limit {} bytes)",
            bytes.len(),
            limit
        )));
    }
    Ok(bytes)
}

/// Route callback replies into a worker's outbound channel. The route only
/// holds a weak sender so a finished worker's channel can close.
pub(super) fn reply_route(tx: mpsc::WeakUnboundedSender<HostMessage>) -> ReplyRoute {
    Arc::new(move |request_id: RequestId, callback_id: CallbackId, reply: CallbackReply| {
        let Some(tx) = tx.upgrade() else {
            tracing::debug!("Worker for request {} is gone; dropping callback reply", request_id);
            return;
        };
        let values_json = match encode_values(&reply.values) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(HostMessage::CallbackResponse {
                    request_id: request_id.to_string(),
                    callback_id: callback_id.to_string(),
                    error: Some(ExecutionError::untransferable(e).to_string()),
                    values_json: Vec::new(),
                });
                return;
            }
        };
        let _ = tx.send(HostMessage::CallbackResponse {
            request_id: request_id.to_string(),
            callback_id: callback_id.to_string(),
            error: reply.error,
            values_json,
        });
    })
}

/// Decode a `Callback` frame and hand it to the relay.
pub(super) fn dispatch_callback(
    relay: &CallbackRelay,
    route: &ReplyRoute,
    request_id: String,
    callback_id: String,
    args_json: &[u8],
) {
    let request_id = RequestId::from(request_id);
    let callback_id = CallbackId::from(callback_id);
    match decode_values(args_json) {
        Ok(args) => {
            relay.dispatch(
                CallbackRequest {
                    request_id,
                    callback_id,
                    args,
                },
                Arc::clone(route),
            );
        }
        Err(e) => {
            tracing::warn!("Undecodable callback arguments for {}: {}", request_id, e);
            route(
                request_id,
                callback_id,
                CallbackReply::err(ExecutionError::untransferable(e).to_string()),
            );
        }
    }
}

/// Wait for a worker to exit, killing it if it lingers.
fn reap(mut child: Child) {
    tokio::spawn(async move {
        match tokio::time::timeout(REAP_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Dedicated worker exited with {}", status),
            Ok(Err(e)) => tracing::debug!("Failed to wait for dedicated worker: {}", e),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill lingering worker: {}", e);
                }
            }
        }
    });
}
