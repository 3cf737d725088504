//! Stdio plumbing for worker processes, and the dedicated-process runtime.
//!
//! stdout carries IPC frames, so a worker must never print to it. One writer
//! task owns stdout; everything else sends [`WorkerMessage`]s through a
//! channel.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::correlation::{CallbackId, RequestId};
use crate::error::Result;
use crate::ipc::protocol::{
    HostMessage, WireOutcome, WorkerMessage, decode_values, encode_values, read_frame, write_frame,
};
use crate::relay::CallbackReply;
use crate::script::{CallbackSink, CallbackTable, HostHandle, ScriptRegistry};

use super::runner::run_script;

/// Sends callback requests to the host over the worker's outbound channel.
pub(crate) struct ChannelSink {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl ChannelSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { tx }
    }
}

impl CallbackSink for ChannelSink {
    fn send_callback(&self, request_id: &RequestId, callback_id: &CallbackId, args: Vec<Value>) -> bool {
        let args_json = match encode_values(&args) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Dropping callback for {}: {}", request_id, e);
                return false;
            }
        };
        self.tx
            .send(WorkerMessage::Callback {
                request_id: request_id.to_string(),
                callback_id: callback_id.to_string(),
                args_json,
            })
            .is_ok()
    }
}

/// Drain `rx` into `out` as frames.
///
/// Returns after writing an `ExecuteResponse` when `stop_after_response` is
/// set, otherwise when every sender is gone.
pub(crate) async fn write_loop<W: AsyncWrite + Unpin>(
    mut out: W,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    stop_after_response: bool,
) -> Result<()> {
    while let Some(message) = rx.recv().await {
        let is_response = matches!(message, WorkerMessage::ExecuteResponse { .. });
        write_frame(&mut out, &message).await?;
        if stop_after_response && is_response {
            break;
        }
    }
    Ok(())
}

/// Turn a `CallbackResponse` frame back into a reply for the waiting script.
pub(crate) fn resolve_callback(
    table: &CallbackTable,
    callback_id: String,
    error: Option<String>,
    values_json: &[u8],
) {
    let reply = match error {
        Some(message) => CallbackReply::err(message),
        None => match decode_values(values_json) {
            Ok(values) => CallbackReply::ok(values),
            Err(e) => CallbackReply::err(format!(
                "value could not be transferred across the boundary: {}",
                e
            )),
        },
    };
    let callback_id = CallbackId::from(callback_id);
    if !table.resolve(&callback_id, reply) {
        tracing::debug!("Dropping response for unknown callback {}", callback_id);
    }
}

/// Serve one execution over stdin/stdout and return once its response has
/// been written, or when the host goes away.
pub async fn run_dedicated(registry: ScriptRegistry) -> Result<()> {
    serve_dedicated(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

pub(crate) async fn serve_dedicated<R, W>(registry: ScriptRegistry, mut input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let registry = Arc::new(registry);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_loop(output, rx, true));
    let table = Arc::new(CallbackTable::new());
    let sink: Arc<dyn CallbackSink> = Arc::new(ChannelSink::new(tx.clone()));

    loop {
        tokio::select! {
            written = &mut writer => {
                return match written {
                    Ok(result) => result,
                    Err(e) => Err(crate::Error::Ipc(format!("Writer task failed: {}", e))),
                };
            }
            frame = read_frame::<_, HostMessage>(&mut input) => {
                let Some(message) = frame? else {
                    tracing::debug!("Host closed the channel; exiting");
                    break;
                };
                match message {
                    HostMessage::Execute { request_id, module_path, inputs_json, has_callback } => {
                        let request_id = RequestId::from(request_id);
                        let host = HostHandle::new(
                            request_id.clone(),
                            has_callback,
                            Arc::clone(&table),
                            Arc::clone(&sink),
                        );
                        let registry = Arc::clone(&registry);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let outcome = match serde_json::from_slice::<Value>(&inputs_json) {
                                Ok(inputs) => {
                                    WireOutcome::from_result(
                                        run_script(&registry, &module_path, inputs, host).await,
                                    )
                                }
                                Err(e) => WireOutcome::Error {
                                    message: format!(
                                        "value could not be transferred across the boundary: {}",
                                        e
                                    ),
                                    stack: None,
                                },
                            };
                            let _ = tx.send(WorkerMessage::ExecuteResponse {
                                request_id: request_id.to_string(),
                                outcome,
                            });
                        });
                    }
                    HostMessage::CallbackResponse { callback_id, error, values_json, .. } => {
                        resolve_callback(&table, callback_id, error, &values_json);
                    }
                    HostMessage::Shutdown => break,
                    HostMessage::Start { .. } => {
                        tracing::warn!("Ignoring Start sent to a dedicated worker");
                    }
                }
            }
        }
    }

    writer.abort();
    Ok(())
}
