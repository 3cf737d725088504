//! Worker process management.
//!
//! Provides [`WorkerProcess`] for spawning isolated worker processes and
//! [`WorkerKillHandle`] for terminating one from anywhere.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Error, Result};

const WORKER_NAME: &str = if cfg!(windows) {
    "warden-worker.exe"
} else {
    "warden-worker"
};

/// A spawned worker process with piped stdin/stdout.
pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    pid: u32,
}

impl WorkerProcess {
    /// Spawn `program --mode <mode> [extra_args...]`.
    ///
    /// The process is killed when its [`Child`] is dropped.
    pub fn spawn(program: &Path, mode: &str, extra_args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .arg("--mode")
            .arg(mode)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Spawn(format!(
                    "Failed to spawn worker process '{}': {}",
                    program.display(),
                    e
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("Worker exited before it could be tracked".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        tracing::debug!("Spawned {} worker process {}", mode, pid);

        Ok(Self {
            child,
            stdin,
            stdout,
            pid,
        })
    }

    /// Get the process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kill_handle(&self) -> WorkerKillHandle {
        WorkerKillHandle::new(self.pid)
    }

    /// Split into the process handle and its pipes.
    pub fn into_parts(self) -> (Child, ChildStdin, ChildStdout) {
        (self.child, self.stdin, self.stdout)
    }
}

/// Locate the worker executable.
///
/// Looks in the following order:
/// 1. The explicitly configured path
/// 2. `WARDEN_WORKER_PATH` environment variable
/// 3. Same directory as the current executable (and its parent, for test binaries in `deps/`)
/// 4. System PATH
/// 5. The cargo `target/{debug,release}` directory
pub fn find_worker_binary(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Spawn(format!(
            "Configured worker executable '{}' does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var("WARDEN_WORKER_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let candidates = [Some(exe_dir), exe_dir.parent()];
        for dir in candidates.into_iter().flatten() {
            let worker_path = dir.join(WORKER_NAME);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_NAME) {
        return Ok(path);
    }

    // For development: try target/debug or target/release
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_NAME);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Spawn(
        "Could not find warden-worker binary. Set WARDEN_WORKER_PATH or ensure it's in PATH."
            .to_string(),
    ))
}

/// Thread-safe handle for killing a worker process from another task.
#[derive(Debug, Clone)]
pub struct WorkerKillHandle {
    pid: u32,
    killed: Arc<AtomicBool>,
}

impl WorkerKillHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kill the worker process immediately. Repeated calls are no-ops.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return; // Already killed
        }

        #[cfg(unix)]
        {
            // SIGKILL for immediate termination
            // SAFETY: plain syscall on a pid we spawned; a stale pid yields ESRCH.
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        tracing::warn!(
            "Cannot signal worker {} on this platform; it will be reaped when its handle drops",
            self.pid
        );
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_missing_path_is_error() {
        let err = find_worker_binary(Some(Path::new("/definitely/not/here/warden-worker")))
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[test]
    fn test_kill_handle_marks_killed_once() {
        // A pid that cannot belong to a live process of ours.
        let handle = WorkerKillHandle::new(u32::MAX / 2);
        assert!(!handle.is_killed());
        handle.kill();
        handle.clone().kill();
        assert!(handle.is_killed());
    }
}
