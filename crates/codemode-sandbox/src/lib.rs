#![warn(missing_docs)]

//! # codemode-sandbox
//!
//! Isolated script execution for the codemode capability surface.
//!
//! A caller-supplied script runs in a fresh V8 isolate inside a dedicated
//! `codemode-worker` child process. The script sees no filesystem, network,
//! timers or process object; the only bridge to the host is a proxy object
//! synthesized from the per-execution [`SerializedBindings`], whose calls travel
//! over a length-delimited JSON channel to the host-side dispatcher.
//!
//! ## Security model
//!
//! - **Process + isolate boundary**: one worker process per [`Sandbox`], a fresh
//!   V8 isolate per execution
//! - **Names, not objects**: only method names cross into the worker; the host
//!   keeps every callable
//! - **Per-execution grant**: every call is authorized against the bindings of
//!   the execution that issued it, not the full capability table
//! - **Hard limits**: wall-clock, CPU-time and heap ceilings terminate the worker
//! - **Redacted errors**: stack traces, paths and credentials never reach the script
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use codemode_sandbox::{capability_fn, CapabilityTable, ExecutionRequest, SandboxPool};
//! use codemode_sandbox::{PoolConfig, SandboxConfig};
//!
//! let table = CapabilityTable::new()
//!     .with("core", "readQuery", capability_fn(|args| async move { Ok(args) }));
//! let bindings = table.serialize();
//! let pool = Arc::new(SandboxPool::new(PoolConfig::default(), SandboxConfig::default(), Arc::new(table))?);
//! pool.initialize().await?;
//!
//! let request = ExecutionRequest::new("return await core.readQuery({ sql: 'select 1' });", bindings);
//! let result = pool.execute(request).await?;
//! assert!(result.success);
//! ```

pub mod bindings;
pub mod error;
pub mod host;
pub mod ipc;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod pool;
pub mod proxy;
pub mod redact;
pub mod runtime;
pub mod sandbox;
pub mod validator;

pub use bindings::{
    capability_fn, serialize_bindings, CallTarget, Capability, CapabilityTable, Grant,
    PermittedCall, SerializedBindings,
};
pub use codemode_error::DispatchError;
pub use error::{PoolError, SandboxError};
pub use pool::{PoolConfig, PoolStats, PooledSandbox, SandboxPool};
pub use sandbox::{
    ExecutionMetrics, ExecutionRequest, ExecutionResult, Sandbox, SandboxConfig, SandboxState,
};

/// The external capability surface, as seen by the host-side dispatcher.
///
/// Implementations perform the privileged operation (run a query, write a
/// row, ...). They can only be reached with a [`PermittedCall`], which is
/// produced exclusively by [`Grant::authorize`], so every call has been checked
/// against the granting execution's bindings before it gets here.
#[async_trait::async_trait]
pub trait CapabilityDispatcher: Send + Sync {
    /// Perform a permitted call with the given JSON arguments.
    async fn dispatch(
        &self,
        call: &PermittedCall,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DispatchError>;
}

/// The worker-side end of the RPC channel.
///
/// The proxy op hands every capability call to a bridge; in the worker binary
/// the bridge forwards it over IPC to the host, in tests it can answer locally.
/// Errors are plain strings because they surface as JavaScript exceptions.
#[async_trait::async_trait]
pub trait CallBridge: Send + Sync {
    /// Issue a call and wait for its correlated response.
    ///
    /// `group` is `None` for top-level methods.
    async fn call(
        &self,
        group: Option<String>,
        method: String,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, String>;

    /// Forward a `codemode.log()` line from the script.
    fn log(&self, message: &str) {
        tracing::info!(target: "codemode::sandbox::script", "{}", message);
    }
}
