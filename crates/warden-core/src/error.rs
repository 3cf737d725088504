//! Error types for warden-core.

use thiserror::Error;

/// Result type for warden-core infrastructure operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Default message of a [`ExecutionError::Timeout`].
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "Timeout error during executing script";

/// Errors raised by the pool machinery itself (spawning, framing, transport).
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A worker process or thread could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Workers did not report ready in time.
    #[error("workers did not become ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    /// Internal HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Failure delivered to the caller of an execution.
///
/// Every execution resolves to exactly one `Ok` value or one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The script returned an error or panicked.
    #[error("{message}")]
    Script {
        message: String,
        stack: Option<String>,
    },

    /// The execution did not finish before its timeout.
    #[error("{message}")]
    Timeout { message: String },

    /// The boundary between host and worker failed: the worker died, or a
    /// value could not be moved across it.
    #[error("{message}")]
    Transport { message: String },
}

impl ExecutionError {
    pub fn script(message: impl Into<String>, stack: Option<String>) -> Self {
        Self::Script {
            message: message.into(),
            stack,
        }
    }

    pub fn timeout(message: Option<String>) -> Self {
        Self::Timeout {
            message: message.unwrap_or_else(|| DEFAULT_TIMEOUT_MESSAGE.to_string()),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// A value failed to decode on the receiving side of the boundary.
    pub fn untransferable(detail: impl std::fmt::Display) -> Self {
        Self::transport(format!(
            "value could not be transferred across the boundary: {}",
            detail
        ))
    }

    /// Weak failures are expected, user-facing outcomes rather than internal faults.
    pub fn is_weak(&self) -> bool {
        matches!(self, Self::Script { .. } | Self::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Script { message, .. }
            | Self::Timeout { message }
            | Self::Transport { message } => message,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Script { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// Misuse of the manager by the host application.
///
/// These are returned synchronously from the offending call and never
/// delivered through an execution's completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolFault {
    #[error("task {0} is already reserved")]
    AlreadyReserved(String),

    #[error("no reservation found for task {0}")]
    ReservationNotFound(String),

    #[error("reservation for task {0} was already released")]
    AlreadyReleased(String),

    /// The reservation was released before any execution bound it to a worker.
    #[error("reservation for task {0} was released before it was bound to a worker")]
    ReservationUnbound(String),

    #[error("the {0} backend does not support task reservations")]
    ReservationsUnsupported(&'static str),

    #[error("script manager is not started")]
    NotStarted,

    /// A request reached a worker of another pool generation.
    #[error("Bad request")]
    BadRequest,
}
