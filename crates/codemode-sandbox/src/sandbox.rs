//! The sandbox entity: one worker process, its limits and its lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use codemode_config::SandboxOverrides;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bindings::{Grant, SerializedBindings};
use crate::error::SandboxError;
use crate::host::{drive_execution, find_worker_binary, Completion, HostDispatcher, WorkerProcess};
use crate::ipc::{ParentMessage, ResourceUsage, WorkerLimits, DEFAULT_MAX_IPC_MESSAGE_SIZE};
use crate::redact::redact_error_message;
use crate::validator::{validate_script, DEFAULT_MAX_SCRIPT_SIZE};
use crate::CapabilityDispatcher;

/// Resource limits and wiring for one sandbox. Immutable once the sandbox exists.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Heap ceiling of the script's isolate, in megabytes.
    pub memory_limit_mb: u64,
    /// Wall-clock ceiling, RPC round trips included.
    pub timeout: Duration,
    /// CPU-time ceiling for the script's own compute.
    pub cpu_limit: Duration,
    /// Capability calls allowed per execution.
    pub max_calls: usize,
    /// Serialized argument size allowed per call, in bytes.
    pub max_call_args_size: usize,
    /// Serialized result size allowed, in bytes.
    pub max_output_size: usize,
    /// Script size allowed, in bytes.
    pub max_script_size: usize,
    /// Largest IPC frame either side accepts, in bytes. Must exceed the
    /// output, script and call-argument limits.
    pub max_ipc_message_size: usize,
    /// How long a new worker has to answer its first health check.
    pub health_check_timeout: Duration,
    /// Extra time the host waits past `timeout` for the worker to report its
    /// own timeout before killing it.
    pub kill_grace: Duration,
    /// Worker binary; discovered when unset. See [`find_worker_binary`].
    pub worker_bin: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 64,
            timeout: Duration::from_secs(5),
            cpu_limit: Duration::from_secs(2),
            max_calls: 100,
            max_call_args_size: 1024 * 1024,
            max_output_size: 1024 * 1024,
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
            health_check_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(1),
            worker_bin: None,
        }
    }
}

impl SandboxConfig {
    /// Defaults with the three core limits set, validated.
    pub fn new(memory_limit_mb: u64, timeout_ms: u64, cpu_limit_ms: u64) -> Result<Self, SandboxError> {
        let config = Self {
            memory_limit_mb,
            timeout: Duration::from_millis(timeout_ms),
            cpu_limit: Duration::from_millis(cpu_limit_ms),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply file overrides on top of the defaults, validated.
    pub fn from_overrides(overrides: &SandboxOverrides) -> Result<Self, SandboxError> {
        let d = Self::default();
        let config = Self {
            memory_limit_mb: overrides.memory_limit_mb.unwrap_or(d.memory_limit_mb),
            timeout: overrides
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.timeout),
            cpu_limit: overrides
                .cpu_limit_ms
                .map(Duration::from_millis)
                .unwrap_or(d.cpu_limit),
            max_calls: overrides.max_calls.unwrap_or(d.max_calls),
            max_call_args_size: overrides
                .max_call_args_size_kb
                .map(|kb| kb * 1024)
                .unwrap_or(d.max_call_args_size),
            max_output_size: overrides
                .max_output_size_kb
                .map(|kb| kb * 1024)
                .unwrap_or(d.max_output_size),
            max_script_size: overrides
                .max_script_size_kb
                .map(|kb| kb * 1024)
                .unwrap_or(d.max_script_size),
            max_ipc_message_size: overrides
                .max_ipc_message_size_mb
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(d.max_ipc_message_size),
            worker_bin: overrides.worker_bin.clone(),
            ..d
        };
        config.validate()?;
        Ok(config)
    }

    /// All limits must be positive, and every payload limit must fit in an IPC frame.
    pub fn validate(&self) -> Result<(), SandboxError> {
        let checks: [(&str, bool); 7] = [
            ("memory_limit_mb", self.memory_limit_mb > 0),
            ("timeout", !self.timeout.is_zero()),
            ("cpu_limit", !self.cpu_limit.is_zero()),
            ("max_calls", self.max_calls > 0),
            ("max_call_args_size", self.max_call_args_size > 0),
            ("max_output_size", self.max_output_size > 0),
            ("max_script_size", self.max_script_size > 0),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, ok)| !ok) {
            return Err(SandboxError::InvalidConfig(format!("{name} must be positive")));
        }
        let largest_payload = self
            .max_output_size
            .max(self.max_script_size)
            .max(self.max_call_args_size);
        if self.max_ipc_message_size <= largest_payload {
            return Err(SandboxError::InvalidConfig(format!(
                "max_ipc_message_size ({} bytes) must exceed the largest payload limit ({} bytes)",
                self.max_ipc_message_size, largest_payload
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Spawned, never executed.
    Created,
    /// Running a script.
    Executing,
    /// Between executions.
    Idle,
    /// Terminal.
    Disposed,
}

impl SandboxState {
    /// `Created` and `Idle` both mean "can take an execution".
    pub fn is_available(self) -> bool {
        matches!(self, Self::Created | Self::Idle)
    }
}

/// A script plus the capabilities it is granted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Correlation id, echoed in logs and over the channel.
    pub id: String,
    /// Body of an async function.
    pub script: String,
    /// The only capabilities this execution can reach.
    pub bindings: SerializedBindings,
}

impl ExecutionRequest {
    /// Create a request with a fresh correlation id.
    pub fn new(script: impl Into<String>, bindings: SerializedBindings) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            script: script.into(),
            bindings,
        }
    }

    /// Use a caller-supplied correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Measurements reported with every result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    /// Host-observed wall time.
    pub wall_time_ms: u64,
    /// Peak resident memory of the worker process over its whole life, so it
    /// never decreases across executions on one sandbox. Best-effort; 0 when
    /// unavailable.
    pub memory_used_mb: u64,
    /// Best-effort; 0 when unavailable.
    pub cpu_time_ms: u64,
    /// Capability calls the host authorized.
    pub rpc_calls: u64,
}

/// Outcome of [`Sandbox::execute`]. Exactly one of `output` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the script completed and returned a value.
    pub success: bool,
    /// The script's return value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Redacted failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Measurements.
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    /// A successful result.
    pub fn succeeded(output: Value, metrics: ExecutionMetrics) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            metrics,
        }
    }

    /// A failed result; the message is redacted.
    pub fn failed(error: &SandboxError, metrics: ExecutionMetrics) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(redact_error_message(&error.to_string())),
            metrics,
        }
    }
}

/// One isolated execution context bound to one `codemode-worker` process.
pub struct Sandbox {
    id: Uuid,
    config: SandboxConfig,
    dispatcher: Arc<dyn CapabilityDispatcher>,
    worker: Option<WorkerProcess>,
    state: SandboxState,
    created_at: Instant,
    last_used: Instant,
    executions: u64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pid", &self.worker.as_ref().and_then(|w| w.pid()))
            .field("executions", &self.executions)
            .finish()
    }
}

impl Sandbox {
    /// Spawn a worker, confirm it answers, and return the sandbox ready for work.
    #[tracing::instrument(skip_all)]
    pub async fn create(
        config: SandboxConfig,
        dispatcher: Arc<dyn CapabilityDispatcher>,
    ) -> Result<Self, SandboxError> {
        config.validate()?;
        let worker_bin = find_worker_binary(config.worker_bin.as_deref())?;
        let mut worker = WorkerProcess::spawn(&worker_bin, config.max_ipc_message_size)?;
        worker.handshake(config.health_check_timeout).await?;

        let now = Instant::now();
        let sandbox = Self {
            id: Uuid::new_v4(),
            config,
            dispatcher,
            worker: Some(worker),
            state: SandboxState::Created,
            created_at: now,
            last_used: now,
            executions: 0,
            cancel: CancellationToken::new(),
        };
        tracing::info!(sandbox_id = %sandbox.id, pid = ?sandbox.worker.as_ref().and_then(|w| w.pid()), "sandbox created");
        Ok(sandbox)
    }

    /// Run one script. Never fails: every outcome is an [`ExecutionResult`].
    ///
    /// Script, validation and permission errors leave the sandbox reusable.
    /// Limit violations and worker faults dispose it.
    #[tracing::instrument(skip_all, fields(sandbox_id = %self.id, execution_id = %request.id))]
    pub async fn execute(&mut self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let metrics_at = |usage: ResourceUsage, rpc_calls: usize| ExecutionMetrics {
            wall_time_ms: started.elapsed().as_millis() as u64,
            memory_used_mb: usage.memory_used_mb,
            cpu_time_ms: usage.cpu_time_ms,
            rpc_calls: rpc_calls as u64,
        };

        if self.cancel.is_cancelled() {
            self.dispose().await;
        }
        let Some(worker) = self.worker.as_mut().filter(|_| self.state != SandboxState::Disposed) else {
            return ExecutionResult::failed(&SandboxError::Disposed, metrics_at(ResourceUsage::default(), 0));
        };

        if let Err(e) = validate_script(&request.script, self.config.max_script_size)
            .and_then(|()| request.bindings.validate())
        {
            tracing::debug!(kind = e.kind(), "request rejected before execution");
            return ExecutionResult::failed(&e, metrics_at(ResourceUsage::default(), 0));
        }

        let ExecutionRequest {
            id: execution_id,
            script,
            bindings,
        } = request;
        self.state = SandboxState::Executing;
        let limits = WorkerLimits::from(&self.config);
        let mut host = HostDispatcher::new(
            Grant::from_bindings(&bindings),
            self.dispatcher.clone(),
            self.config.max_calls,
            self.config.max_call_args_size,
        );
        let deadline = self.config.timeout + self.config.kill_grace;
        let cancel = self.cancel.clone();

        let outcome: Result<Completion, SandboxError> = async {
            worker
                .send(&ParentMessage::Execute {
                    execution_id: execution_id.clone(),
                    script,
                    bindings,
                    limits: limits.clone(),
                })
                .await?;
            tokio::select! {
                done = tokio::time::timeout(deadline, drive_execution(worker, &execution_id, &mut host)) => {
                    done.unwrap_or(Err(SandboxError::Timeout { timeout_ms: limits.timeout_ms }))
                }
                _ = cancel.cancelled() => Err(SandboxError::Disposed),
            }
        }
        .await;

        let (result, usage) = match outcome {
            Ok(completion) => (
                completion.outcome.map_err(|f| f.into_error(&limits)),
                completion.usage,
            ),
            Err(e) => (Err(e), ResourceUsage::default()),
        };
        let metrics = metrics_at(usage, host.calls_made());
        self.last_used = Instant::now();
        self.executions += 1;

        match result {
            Ok(output) => {
                self.state = SandboxState::Idle;
                tracing::debug!(wall_time_ms = metrics.wall_time_ms, rpc_calls = metrics.rpc_calls, "execution succeeded");
                ExecutionResult::succeeded(output, metrics)
            }
            Err(e) if e.is_fatal() => {
                tracing::warn!(kind = e.kind(), wall_time_ms = metrics.wall_time_ms, "execution failed fatally, disposing sandbox: {e}");
                self.dispose().await;
                ExecutionResult::failed(&e, metrics)
            }
            Err(e) => {
                self.state = SandboxState::Idle;
                tracing::debug!(kind = e.kind(), wall_time_ms = metrics.wall_time_ms, "execution failed");
                ExecutionResult::failed(&e, metrics)
            }
        }
    }

    /// True iff not disposed and the worker process is alive.
    pub fn is_healthy(&mut self) -> bool {
        if self.state == SandboxState::Disposed || self.cancel.is_cancelled() {
            return false;
        }
        self.worker.as_mut().is_some_and(|w| w.is_alive())
    }

    /// Kill the worker and mark the sandbox disposed. Idempotent.
    pub async fn dispose(&mut self) {
        if self.state == SandboxState::Disposed {
            return;
        }
        self.state = SandboxState::Disposed;
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            worker.kill().await;
        }
        tracing::info!(sandbox_id = %self.id, executions = self.executions, "sandbox disposed");
    }

    /// Stable identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// When the worker was spawned.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the last execution finished or the sandbox was last returned to
    /// a pool (creation time before either).
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Time since [`last_used`](Self::last_used).
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Executions run so far.
    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// The limits this sandbox enforces.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Cancelling the token terminates a running execution and disposes the sandbox.
    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        // The worker is killed on drop; stop anything still waiting on it.
        self.cancel.cancel();
    }
}
