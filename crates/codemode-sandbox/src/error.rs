//! Error types for the codemode sandbox.

use thiserror::Error;

/// Errors that can occur while creating or executing a sandbox.
///
/// [`Sandbox::execute`](crate::Sandbox::execute) never returns these directly;
/// they are rendered into a failed [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A resource limit was zero or otherwise unusable.
    #[error("invalid sandbox config: {0}")]
    InvalidConfig(String),

    /// Script failed validation checks.
    #[error("script validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Script exceeds the configured maximum size.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    ScriptTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`. The sandbox has no filesystem, network, module or runtime access; call the granted capabilities instead, and use help() to list them.")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The bindings granted to an execution cannot be installed.
    #[error("invalid bindings: {reason}")]
    InvalidBindings {
        /// What went wrong.
        reason: String,
    },

    /// The script threw, or failed to compile.
    #[error("script error: {message}")]
    Script {
        /// The error message from JavaScript.
        message: String,
    },

    /// Wall-clock ceiling exceeded.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Heap ceiling exceeded.
    #[error("memory limit exceeded ({limit_mb}MB)")]
    MemoryLimitExceeded {
        /// Configured heap ceiling in megabytes.
        limit_mb: u64,
    },

    /// CPU-time ceiling exceeded.
    #[error("cpu time limit exceeded ({limit_ms}ms)")]
    CpuLimitExceeded {
        /// Configured CPU-time ceiling in milliseconds.
        limit_ms: u64,
    },

    /// Serialized script output exceeds the configured maximum.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// The sandbox was disposed; it accepts no further executions.
    #[error("sandbox is disposed")]
    Disposed,

    /// The worker process died or closed its channel mid-execution.
    #[error("sandbox worker crashed: {reason}")]
    WorkerCrashed {
        /// What was observed.
        reason: String,
    },

    /// Spawning or driving the worker failed.
    #[error("sandbox worker failure: {0}")]
    Worker(#[from] anyhow::Error),

    /// Reading or writing an IPC frame failed.
    #[error("ipc error: {0}")]
    Ipc(#[from] std::io::Error),

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Whether the sandbox must be disposed after this error.
    ///
    /// Resource-limit violations and worker faults leave the worker in a state
    /// that is not trusted for reuse. Script, validation and output errors do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::MemoryLimitExceeded { .. }
                | Self::CpuLimitExceeded { .. }
                | Self::Disposed
                | Self::WorkerCrashed { .. }
                | Self::Worker(_)
                | Self::Ipc(_)
        )
    }

    /// Short, stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::ValidationFailed { .. }
            | Self::ScriptTooLarge { .. }
            | Self::BannedPattern { .. } => "validation",
            Self::InvalidBindings { .. } => "invalid_bindings",
            Self::Script { .. } => "script",
            Self::Timeout { .. } => "timeout",
            Self::MemoryLimitExceeded { .. } => "memory_limit",
            Self::CpuLimitExceeded { .. } => "cpu_limit",
            Self::OutputTooLarge { .. } => "output_too_large",
            Self::Disposed => "disposed",
            Self::WorkerCrashed { .. } | Self::Worker(_) | Self::Ipc(_) => "worker",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Errors from [`SandboxPool`](crate::SandboxPool).
///
/// These precede any execution attempt and are the only sandbox-related
/// failures surfaced as `Err` rather than as a failed result.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool sizing is inconsistent.
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),

    /// No sandbox became available within the acquire timeout.
    #[error("sandbox pool exhausted: all {max} sandboxes busy after waiting {waited_ms}ms")]
    Exhausted {
        /// Configured `max_instances`.
        max: usize,
        /// How long the caller queued.
        waited_ms: u64,
    },

    /// The pool has been disposed.
    #[error("sandbox pool is disposed")]
    Closed,

    /// A new sandbox could not be started.
    #[error("failed to start sandbox: {0}")]
    Spawn(#[source] SandboxError),
}
