//! Isolated-unit runtime.
//!
//! Entry points for worker processes ([`run_dedicated`], [`run_server`]) and
//! the script runner shared with in-process worker threads.

mod process;
mod runner;
mod server;

pub use process::run_dedicated;
pub use runner::run_script;
pub use server::run_server;

/// How a worker process serves executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// One execution over stdio, then exit.
    Dedicated,
    /// Many concurrent executions over an internal HTTP endpoint.
    Server,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dedicated => "dedicated",
            Self::Server => "server",
        }
    }
}

/// Run a worker process in `mode` until the host releases it.
pub async fn run_worker(mode: WorkerMode, registry: crate::ScriptRegistry) -> crate::Result<()> {
    match mode {
        WorkerMode::Dedicated => run_dedicated(registry).await,
        WorkerMode::Server => run_server(registry).await,
    }
}
