//! Warden worker process.
//!
//! Spawned by the host's process pools. stdin/stdout carry IPC frames, so all
//! logging goes to stderr.

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use warden_core::WorkerMode;

#[derive(Parser)]
#[command(name = "warden-worker")]
#[command(about = "Isolated script worker for warden")]
#[command(version)]
struct Cli {
    /// How to serve executions
    #[arg(long, value_enum, default_value = "dedicated")]
    mode: Mode,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Run one execution over stdio, then exit
    Dedicated,
    /// Serve executions over an internal HTTP endpoint
    Server,
}

impl From<Mode> for WorkerMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Dedicated => WorkerMode::Dedicated,
            Mode::Server => WorkerMode::Server,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WARDEN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    warden_core::run_worker(cli.mode.into(), warden_worker::registry()).await?;
    Ok(())
}
