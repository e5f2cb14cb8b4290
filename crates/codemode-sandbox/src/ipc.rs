//! IPC protocol for host ↔ worker communication.
//!
//! Uses length-delimited JSON messages: 4-byte big-endian length prefix + JSON payload.
//! All messages are typed via [`ParentMessage`] and [`ChildMessage`] enums.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bindings::SerializedBindings;
use crate::error::SandboxError;

/// Messages sent from the host to the worker child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// Liveness probe, answered with [`ChildMessage::ResetComplete`].
    Reset,
    /// Run a script in a fresh isolate.
    Execute {
        /// Correlates the eventual [`ChildMessage::ExecutionComplete`].
        execution_id: String,
        /// Script body; wrapped in an async function by the worker.
        script: String,
        /// Names to install as proxy objects.
        bindings: SerializedBindings,
        /// Resource ceilings for this execution.
        limits: WorkerLimits,
    },
    /// Response to a call request from the child.
    CallResult {
        /// Matches the id from [`ChildMessage::CallRequest`].
        id: u64,
        /// The call's return value, or a redacted error message.
        result: Result<Value, String>,
    },
}

/// Messages sent from the worker child to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// The worker is alive and idle.
    ResetComplete,
    /// Ask the host to perform a capability call.
    CallRequest {
        /// Unique within the execution; ids start at 0.
        id: u64,
        /// Group name, absent for top-level methods.
        group: Option<String>,
        /// Method name.
        method: String,
        /// Call arguments.
        args: Value,
    },
    /// The execution has finished.
    ExecutionComplete {
        /// Matches the id from [`ParentMessage::Execute`].
        execution_id: String,
        /// Script return value, or a classified failure.
        outcome: Result<Value, ScriptFailure>,
        /// Resources the execution consumed.
        usage: ResourceUsage,
    },
    /// A `codemode.log()` line from the script.
    Log {
        /// The log message text.
        message: String,
    },
}

/// Resource ceilings sent with each execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLimits {
    /// Wall-clock ceiling.
    pub timeout_ms: u64,
    /// Heap ceiling in megabytes.
    pub memory_limit_mb: u64,
    /// CPU-time ceiling.
    pub cpu_limit_ms: u64,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
    /// Largest frame the worker accepts once this execution starts.
    /// Defaults to [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl From<&crate::SandboxConfig> for WorkerLimits {
    fn from(config: &crate::SandboxConfig) -> Self {
        Self {
            timeout_ms: config.timeout.as_millis() as u64,
            memory_limit_mb: config.memory_limit_mb,
            cpu_limit_ms: config.cpu_limit.as_millis() as u64,
            max_output_size: config.max_output_size,
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }
}

/// Coarse classification of a failed execution, as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The script threw or did not compile.
    Script,
    /// Wall-clock ceiling hit.
    Timeout,
    /// Heap ceiling hit.
    MemoryLimit,
    /// CPU-time ceiling hit.
    CpuLimit,
    /// Result too large to return.
    OutputTooLarge,
    /// The worker itself failed.
    Internal,
}

/// A failed execution as it crosses the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFailure {
    /// What kind of failure.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl From<&SandboxError> for ScriptFailure {
    fn from(err: &SandboxError) -> Self {
        let kind = match err {
            SandboxError::Timeout { .. } => FailureKind::Timeout,
            SandboxError::MemoryLimitExceeded { .. } => FailureKind::MemoryLimit,
            SandboxError::CpuLimitExceeded { .. } => FailureKind::CpuLimit,
            SandboxError::OutputTooLarge { .. } => FailureKind::OutputTooLarge,
            SandboxError::Script { .. }
            | SandboxError::InvalidBindings { .. }
            | SandboxError::Serialization(_) => FailureKind::Script,
            _ => FailureKind::Internal,
        };
        let message = match err {
            SandboxError::Script { message } => message.clone(),
            other => other.to_string(),
        };
        Self { kind, message }
    }
}

impl ScriptFailure {
    /// Rebuild the host-side error, using `limits` for the ceiling values.
    pub fn into_error(self, limits: &WorkerLimits) -> SandboxError {
        match self.kind {
            FailureKind::Script => SandboxError::Script {
                message: self.message,
            },
            FailureKind::Timeout => SandboxError::Timeout {
                timeout_ms: limits.timeout_ms,
            },
            FailureKind::MemoryLimit => SandboxError::MemoryLimitExceeded {
                limit_mb: limits.memory_limit_mb,
            },
            FailureKind::CpuLimit => SandboxError::CpuLimitExceeded {
                limit_ms: limits.cpu_limit_ms,
            },
            FailureKind::OutputTooLarge => SandboxError::OutputTooLarge {
                max: limits.max_output_size,
            },
            FailureKind::Internal => SandboxError::WorkerCrashed {
                reason: self.message,
            },
        }
    }
}

/// Best-effort resource usage of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time consumed by the worker during the execution.
    pub cpu_time_ms: u64,
    /// Lifetime peak resident memory of the worker process, 0 when unavailable.
    pub memory_used_mb: u64,
}

/// Write a length-delimited JSON message to an async writer.
///
/// Format: 4-byte big-endian length prefix followed by the JSON payload bytes.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Read a length-delimited JSON message from an async reader.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
/// Uses [`DEFAULT_MAX_IPC_MESSAGE_SIZE`] as the size limit.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message with a configurable size limit.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC message too large: {} bytes (limit: {} bytes)",
                len, max_size
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}
