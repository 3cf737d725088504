//! Isolated script execution for Warden.
//!
//! This crate provides:
//! - Three isolation backends: subprocess per call, pooled subprocesses
//!   behind an internal HTTP endpoint, and in-process worker threads
//! - Request correlation with exactly-once resolution
//! - Host callbacks invoked from running scripts
//! - Per-execution timeouts and affinity reservations
//! - The worker-side runtime that serves executions

pub mod affinity;
pub mod config;
pub mod correlation;
pub mod error;
pub mod ipc;
pub mod manager;
pub mod pool;
pub mod relay;
pub mod script;
mod sync;
pub mod timeout;
pub mod worker;

pub use config::{ManagerConfig, ScriptTimeout, Strategy};
pub use correlation::{CallbackId, Completion, CorrelationRegistry, PendingRequest, RequestId};
pub use error::{DEFAULT_TIMEOUT_MESSAGE, Error, ExecutionError, ProtocolFault, Result};
pub use manager::{ExecuteOptions, Execution, ScriptManager, TaskReservation};
pub use pool::{Backend, CancelToken, WorkerId};
pub use relay::{CallbackRelay, CallbackReply, HostCallback, Responder, host_callback};
pub use script::{HostHandle, Script, ScriptFault, ScriptRegistry};
pub use worker::{WorkerMode, run_worker};
