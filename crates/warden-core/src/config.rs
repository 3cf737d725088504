//! Manager configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default input request limit for the HTTP server backend (200 MB).
pub const DEFAULT_INPUT_REQUEST_LIMIT: usize = 200_000_000;

/// Which isolation backend runs scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// A fresh worker process for every execution.
    DedicatedProcess,
    /// Long-lived worker processes behind an internal HTTP endpoint.
    #[default]
    HttpServer,
    /// Long-lived worker threads inside the host process.
    WorkerThreads,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DedicatedProcess => "dedicated-process",
            Self::HttpServer => "http-server",
            Self::WorkerThreads => "worker-threads",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dedicated-process" | "process" => Ok(Self::DedicatedProcess),
            "http-server" | "server" => Ok(Self::HttpServer),
            "worker-threads" | "threads" => Ok(Self::WorkerThreads),
            other => Err(format!("Unsupported scripts manager strategy: {}", other)),
        }
    }
}

/// How long an execution may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptTimeout {
    After(Duration),
    Disabled,
}

impl ScriptTimeout {
    /// Interpret a millisecond count, where `-1` disables the timeout.
    pub fn from_millis(millis: i64) -> Self {
        if millis < 0 {
            Self::Disabled
        } else {
            Self::After(Duration::from_millis(millis as u64))
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::After(duration) => Some(*duration),
            Self::Disabled => None,
        }
    }
}

impl Default for ScriptTimeout {
    fn default() -> Self {
        Self::After(Duration::from_secs(10))
    }
}

/// Configuration for a [`ScriptManager`](crate::ScriptManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Isolation backend.
    pub strategy: Strategy,
    /// Number of long-lived workers (ignored by the dedicated-process backend).
    pub num_workers: usize,
    /// Default execution timeout.
    pub timeout: ScriptTimeout,
    /// Host the internal HTTP endpoints bind to.
    pub host: String,
    /// Maximum request body accepted by the internal HTTP endpoint (`None` = unlimited).
    pub input_request_limit: Option<usize>,
    /// Explicit path to the worker executable.
    pub worker_program: Option<PathBuf>,
    /// Extra arguments passed to every worker process.
    pub worker_args: Vec<String>,
    /// How long `start` waits for all workers to report ready.
    pub startup_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            num_workers: 1,
            timeout: ScriptTimeout::default(),
            host: "127.0.0.1".to_string(),
            input_request_limit: Some(DEFAULT_INPUT_REQUEST_LIMIT),
            worker_program: None,
            worker_args: Vec::new(),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - WARDEN_STRATEGY: "dedicated-process", "http-server" or "worker-threads"
    /// - WARDEN_WORKERS: Number of workers (default: 1)
    /// - WARDEN_TIMEOUT_MS: Default timeout in ms (-1 = no timeout)
    /// - WARDEN_HOST: Host for internal endpoints (default: 127.0.0.1)
    /// - WARDEN_INPUT_LIMIT: Max request body in bytes (-1 = unlimited)
    /// - WARDEN_WORKER_PATH: Path to the worker executable
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            strategy: std::env::var("WARDEN_STRATEGY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.strategy),
            num_workers: std::env::var("WARDEN_WORKERS")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .map(|n| n.max(1))
                .unwrap_or(defaults.num_workers),
            timeout: std::env::var("WARDEN_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .map(ScriptTimeout::from_millis)
                .unwrap_or(defaults.timeout),
            host: std::env::var("WARDEN_HOST").unwrap_or(defaults.host),
            input_request_limit: match std::env::var("WARDEN_INPUT_LIMIT")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
            {
                Some(limit) if limit < 0 => None,
                Some(limit) => Some(limit as usize),
                None => defaults.input_request_limit,
            },
            worker_program: std::env::var("WARDEN_WORKER_PATH").ok().map(PathBuf::from),
            worker_args: defaults.worker_args,
            startup_timeout: defaults.startup_timeout,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: ScriptTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_input_request_limit(mut self, limit: Option<usize>) -> Self {
        self.input_request_limit = limit;
        self
    }

    pub fn with_worker_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.strategy, Strategy::HttpServer);
        assert_eq!(config.num_workers, 1);
        assert_eq!(config.timeout, ScriptTimeout::After(Duration::from_secs(10)));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.input_request_limit, Some(DEFAULT_INPUT_REQUEST_LIMIT));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("dedicated-process".parse(), Ok(Strategy::DedicatedProcess));
        assert_eq!("HTTP-SERVER".parse(), Ok(Strategy::HttpServer));
        assert_eq!("threads".parse(), Ok(Strategy::WorkerThreads));

        let err = "in-browser".parse::<Strategy>().unwrap_err();
        assert!(err.contains("in-browser"));
    }

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(ScriptTimeout::from_millis(-1), ScriptTimeout::Disabled);
        assert_eq!(
            ScriptTimeout::from_millis(250).duration(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_with_workers_never_zero() {
        let config = ManagerConfig::default().with_workers(0);
        assert_eq!(config.num_workers, 1);
    }
}
