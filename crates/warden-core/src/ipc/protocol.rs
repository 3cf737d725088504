//! IPC protocol messages for warden worker processes.
//!
//! Uses length-prefixed rkyv messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.
//!
//! Script values travel inside the frames as JSON bytes, so whatever
//! `serde_json::Value` can hold can cross the boundary.

use rkyv::{Archive, Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::correlation::Completion;
use crate::error::{Error, ExecutionError, Result};
use crate::script::ScriptFault;

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Message sent from the host to a worker process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum HostMessage {
    /// Configure a multiplexed worker and ask it to start listening.
    Start {
        /// Pool generation; requests carrying another generation are rejected.
        generation: u64,
        /// Host to bind the internal endpoint to.
        host: String,
        /// Maximum request body in bytes, or -1 for unlimited.
        input_request_limit: i64,
    },

    /// Run a script (dedicated workers only; multiplexed workers take
    /// executions over HTTP).
    Execute {
        request_id: String,
        module_path: String,
        /// Inputs as JSON.
        inputs_json: Vec<u8>,
        has_callback: bool,
    },

    /// Reply to a callback the worker asked for.
    CallbackResponse {
        request_id: String,
        callback_id: String,
        /// Error message, if the callback failed.
        error: Option<String>,
        /// Result values as a JSON array.
        values_json: Vec<u8>,
    },

    /// Stop the worker process once in-flight work is abandoned.
    Shutdown,
}

/// Message sent from a worker process to the host.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// The multiplexed worker's endpoint is accepting requests.
    Listening { port: u16, pid: u32 },

    /// The worker has started servicing a request.
    Register { request_id: String, pid: u32 },

    /// A script wants the caller's callback invoked.
    Callback {
        request_id: String,
        callback_id: String,
        /// Arguments as a JSON array.
        args_json: Vec<u8>,
    },

    /// Outcome of an `Execute` (dedicated workers only).
    ExecuteResponse {
        request_id: String,
        outcome: WireOutcome,
    },

    /// The worker has finished servicing a request.
    Completed { request_id: String },
}

/// Outcome of one script run as it crosses the boundary.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum WireOutcome {
    /// Result value as JSON.
    Data { json: Vec<u8> },
    /// Script error, flattened to text.
    Error { message: String, stack: Option<String> },
}

impl WireOutcome {
    pub fn from_result(result: std::result::Result<Value, ScriptFault>) -> Self {
        match result {
            Ok(value) => match serde_json::to_vec(&value) {
                Ok(json) => Self::Data { json },
                Err(e) => Self::Error {
                    message: format!("Failed to encode script result: {}", e),
                    stack: None,
                },
            },
            Err(fault) => Self::Error {
                message: fault.message,
                stack: fault.stack,
            },
        }
    }

    /// Turn the wire form back into the caller-facing completion.
    pub fn into_completion(self) -> Completion {
        match self {
            Self::Data { json } => {
                serde_json::from_slice(&json).map_err(ExecutionError::untransferable)
            }
            Self::Error { message, stack } => Err(ExecutionError::script(message, stack)),
        }
    }
}

/// Reject payloads the receiving side would refuse to read.
pub fn check_frame_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes (limit {} bytes)",
            len, MAX_FRAME_LEN
        )));
    }
    Ok(())
}

/// Encode a list of values for a `Callback` or `CallbackResponse` frame.
pub fn encode_values(values: &[Value]) -> Result<Vec<u8>> {
    serde_json::to_vec(values)
        .map_err(|e| Error::Serialization(format!("Failed to encode values: {}", e)))
}

pub fn decode_values(bytes: &[u8]) -> Result<Vec<Value>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Serialization(format!("Failed to decode values: {}", e)))
}

/// Write a message using length-prefixed rkyv encoding.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    check_frame_len(bytes.len())?;
    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message using length-prefixed rkyv encoding.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
///
/// # Safety
///
/// Uses unchecked deserialization. Only safe when reading from trusted
/// sources (our own worker processes or their parent host).
pub async fn read_frame<R: AsyncRead + Unpin, T>(reader: &mut R) -> Result<Option<T>>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e)));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    check_frame_len(len)?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // rkyv needs its input aligned; a Vec<u8> carries no such guarantee.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(len);
    aligned.extend_from_slice(&bytes);

    // SAFETY: frames only come from our own worker processes or host.
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&aligned) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(Some(message))
}

/// Body of an execution request on the internal HTTP endpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecuteBody {
    pub inputs: Value,
    pub options: ExecuteBodyOptions,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecuteBodyOptions {
    pub request_id: String,
    pub module_path: String,
    #[serde(default)]
    pub has_callback: bool,
    pub generation: u64,
}

/// Body of a successful (HTTP 200) execution response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DataReply {
    pub data: Value,
}

/// Body of a failed (HTTP 500) execution response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorReply {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}
