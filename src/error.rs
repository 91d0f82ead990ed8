//! Error types for inbox-pilot.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("State file error: {0}")]
    State(#[from] StateError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Document {name} not found in {stage}")]
    NotFound { stage: String, name: String },

    #[error("Document {name} already exists in {stage}")]
    AlreadyExists { stage: String, name: String },

    #[error("Cannot move {name} from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("Invalid document name: {0}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from running an external process under a deadline.
#[derive(Debug, thiserror::Error)]
pub enum DeadlineError {
    #[error("Executable not found: {program}")]
    NotFound { program: String },

    #[error("Working directory {dir} for {program} does not exist")]
    MissingWorkdir { program: String, dir: PathBuf },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut {
        program: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("{program} cancelled by shutdown")]
    Cancelled { program: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasoning dispatch errors.
///
/// Only configuration problems surface as errors; a failed or timed-out agent
/// run is an ordinary outcome that leaves the task for the next cycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Reasoning agent executable not found: {program}")]
    AgentNotFound { program: String },

    #[error("Reasoning agent is not configured")]
    NoAgentCommand,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Template error for {kind}: {reason}")]
    Template { kind: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action executor errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No executor configured for channel {channel}")]
    NotConfigured { channel: String },

    #[error("Executor for {channel} failed: {reason}")]
    Failed { channel: String, reason: String },

    #[error("Executor for {channel} returned invalid output: {reason}")]
    InvalidOutput { channel: String, reason: String },

    #[error("Executor process error: {0}")]
    Process(#[from] DeadlineError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Singleton lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Another instance is already running (pid {pid}, lock {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("IO error on lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Process supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Process {name} has an empty command")]
    EmptyCommand { name: String },

    #[error("Duplicate process name: {name}")]
    DuplicateName { name: String },

    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operator notification errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notifier process error: {0}")]
    Process(#[from] DeadlineError),

    #[error("Notifier exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

/// Persisted state file errors (quota, alert, schedule records).
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
