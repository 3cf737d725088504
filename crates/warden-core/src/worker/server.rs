//! Multiplexed worker runtime: an internal HTTP endpoint serving many
//! executions concurrently, with callbacks relayed over stdio.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::correlation::RequestId;
use crate::error::{Error, ProtocolFault, Result};
use crate::ipc::protocol::{
    DataReply, ErrorBody, ErrorReply, ExecuteBody, HostMessage, WorkerMessage, read_frame,
};
use crate::script::{CallbackSink, CallbackTable, HostHandle, ScriptRegistry};

use super::process::{ChannelSink, resolve_callback, write_loop};
use super::runner::run_script;

/// Shared state of one multiplexed worker.
pub(crate) struct ServerState {
    registry: ScriptRegistry,
    generation: u64,
    pid: u32,
    table: Arc<CallbackTable>,
    sink: Arc<dyn CallbackSink>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

/// Create the router for the internal endpoint.
///
/// `input_request_limit` of `None` accepts bodies of any size.
pub(crate) fn create_router(state: Arc<ServerState>, input_request_limit: Option<usize>) -> Router {
    let router = Router::new()
        .route("/", post(execute_handler))
        .layer(DefaultBodyLimit::disable());

    let router = match input_request_limit {
        Some(limit) => router.layer(RequestBodyLimitLayer::new(limit)),
        None => router,
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn execute_handler(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let Ok(body) = serde_json::from_slice::<ExecuteBody>(&body) else {
        return bad_request();
    };
    if body.options.generation != state.generation {
        tracing::warn!(
            "Rejecting request for generation {} (current {})",
            body.options.generation,
            state.generation
        );
        return bad_request();
    }

    let request_id = RequestId::from(body.options.request_id);
    let _ = state.tx.send(WorkerMessage::Register {
        request_id: request_id.to_string(),
        pid: state.pid,
    });

    let host = HostHandle::new(
        request_id.clone(),
        body.options.has_callback,
        Arc::clone(&state.table),
        Arc::clone(&state.sink),
    );
    let result = run_script(&state.registry, &body.options.module_path, body.inputs, host).await;

    let _ = state.tx.send(WorkerMessage::Completed {
        request_id: request_id.to_string(),
    });

    match result {
        Ok(data) => (StatusCode::OK, Json(DataReply { data })).into_response(),
        Err(fault) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorReply {
                error: ErrorBody {
                    message: fault.message,
                    stack: fault.stack,
                },
            }),
        )
            .into_response(),
    }
}

fn bad_request() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorReply {
            error: ErrorBody {
                message: ProtocolFault::BadRequest.to_string(),
                stack: None,
            },
        }),
    )
        .into_response()
}

/// Wait for `Start`, serve the internal endpoint, and relay callbacks over
/// stdin/stdout until the host closes the channel or asks for shutdown.
pub async fn run_server(registry: ScriptRegistry) -> Result<()> {
    serve_multiplexed(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

pub(crate) async fn serve_multiplexed<R, W>(registry: ScriptRegistry, mut input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(output, rx, false));

    let (generation, host, input_request_limit) = loop {
        match read_frame::<_, HostMessage>(&mut input).await? {
            None => {
                writer.abort();
                return Ok(());
            }
            Some(HostMessage::Start {
                generation,
                host,
                input_request_limit,
            }) => break (generation, host, input_request_limit),
            Some(HostMessage::Shutdown) => {
                writer.abort();
                return Ok(());
            }
            Some(other) => tracing::warn!("Ignoring {:?} before Start", other),
        }
    };

    let listener = TcpListener::bind((host.as_str(), 0)).await?;
    let port = listener.local_addr()?.port();
    let pid = std::process::id();

    let table = Arc::new(CallbackTable::new());
    let state = Arc::new(ServerState {
        registry,
        generation,
        pid,
        table: Arc::clone(&table),
        sink: Arc::new(ChannelSink::new(tx.clone())),
        tx: tx.clone(),
    });
    let limit = usize::try_from(input_request_limit).ok();
    let app = create_router(state, limit);

    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    tracing::debug!("Worker {} listening on {}:{}", pid, host, port);
    tx.send(WorkerMessage::Listening { port, pid })
        .map_err(|_| Error::Ipc("Host channel closed before Listening".to_string()))?;

    loop {
        match read_frame::<_, HostMessage>(&mut input).await? {
            None | Some(HostMessage::Shutdown) => break,
            Some(HostMessage::CallbackResponse {
                callback_id,
                error,
                values_json,
                ..
            }) => resolve_callback(&table, callback_id, error, &values_json),
            Some(other) => tracing::warn!("Ignoring {:?} on a multiplexed worker", other),
        }
    }

    server.abort();
    writer.abort();
    Ok(())
}
