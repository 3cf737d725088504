//! Inter-process communication for warden worker processes.
//!
//! This module provides the protocol and utilities for communicating
//! with isolated worker processes that execute scripts.

pub mod protocol;
mod worker;

pub use protocol::{
    DataReply, ErrorBody, ErrorReply, ExecuteBody, ExecuteBodyOptions, HostMessage, WireOutcome,
    WorkerMessage, read_frame, write_frame,
};
pub use worker::{WorkerKillHandle, WorkerProcess, find_worker_binary};
