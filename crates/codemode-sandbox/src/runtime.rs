//! Script runtime: a fresh V8 isolate per execution.
//!
//! V8 isolates are `!Send`, so every run happens on a dedicated thread with its
//! own single-threaded tokio runtime ([`spawn_script`]). A watchdog thread
//! enforces the wall-clock and CPU-time ceilings by terminating the isolate; a
//! near-heap-limit callback does the same for the heap ceiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bindings::SerializedBindings;
use crate::error::SandboxError;
use crate::ipc::{ResourceUsage, WorkerLimits};
use crate::ops::{codemode_ext, ScriptResult};
use crate::proxy::{build_bootstrap, wrap_script};
use crate::CallBridge;

/// Smallest heap V8 is given, whatever the configured ceiling.
const MIN_HEAP_MB: u64 = 8;

/// How often the watchdog samples elapsed and CPU time.
const WATCHDOG_TICK: Duration = Duration::from_millis(10);

/// Outcome of one script run plus what it cost.
#[derive(Debug)]
pub struct ScriptRun {
    /// The script's return value, or why it has none.
    pub result: Result<Value, SandboxError>,
    /// Best-effort resource usage.
    pub usage: ResourceUsage,
}

impl ScriptRun {
    fn failed(err: SandboxError) -> Self {
        Self {
            result: Err(err),
            usage: ResourceUsage::default(),
        }
    }
}

/// Run a script on a new dedicated thread.
///
/// The receiver yields the run's outcome; it errors only if the thread died
/// without reporting.
pub fn spawn_script(
    limits: WorkerLimits,
    script: String,
    bindings: SerializedBindings,
    bridge: Arc<dyn CallBridge>,
) -> Result<oneshot::Receiver<ScriptRun>, SandboxError> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("codemode-isolate".into())
        .spawn(move || {
            let run = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(run_script(&limits, &script, &bindings, bridge)),
                Err(e) => ScriptRun::failed(SandboxError::Worker(e.into())),
            };
            if tx.send(run).is_err() {
                tracing::warn!("script result receiver dropped before result was sent");
            }
        })
        .map_err(|e| SandboxError::Worker(anyhow::anyhow!("failed to spawn isolate thread: {e}")))?;
    Ok(rx)
}

/// Run a script on the current thread, which must not be shared with other
/// isolates.
pub async fn run_script(
    limits: &WorkerLimits,
    script: &str,
    bindings: &SerializedBindings,
    bridge: Arc<dyn CallBridge>,
) -> ScriptRun {
    let cpu_start = process_cpu_time();
    let result = execute(limits, script, bindings, bridge).await;
    let cpu_time_ms = match (cpu_start, process_cpu_time()) {
        (Some(start), Some(end)) => end.saturating_sub(start).as_millis() as u64,
        _ => 0,
    };
    ScriptRun {
        result,
        usage: ResourceUsage {
            cpu_time_ms,
            memory_used_mb: peak_memory_mb().unwrap_or(0),
        },
    }
}

async fn execute(
    limits: &WorkerLimits,
    script: &str,
    bindings: &SerializedBindings,
    bridge: Arc<dyn CallBridge>,
) -> Result<Value, SandboxError> {
    let bootstrap = build_bootstrap(bindings)?;
    let heap_mb = limits.memory_limit_mb.max(MIN_HEAP_MB);
    let mut runtime = create_runtime(bridge, (heap_mb * 1024 * 1024) as usize);

    runtime
        .execute_script("[codemode:bootstrap]", bootstrap)
        .map_err(|e| SandboxError::Worker(anyhow::anyhow!("bootstrap failed: {e}")))?;

    run_user_code(&mut runtime, script, limits).await
}

/// Create a fresh JsRuntime with the codemode extension loaded and V8 heap limits set.
fn create_runtime(bridge: Arc<dyn CallBridge>, max_heap_size: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);

    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![codemode_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(bridge);
    runtime
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState owned by run_user_code,
    // which outlives every run of the isolate's event loop.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Flags set by the watchdog when it terminates the isolate.
#[derive(Default)]
struct Tripwires {
    wall: AtomicBool,
    cpu: AtomicBool,
}

async fn run_user_code(
    runtime: &mut JsRuntime,
    script: &str,
    limits: &WorkerLimits,
) -> Result<Value, SandboxError> {
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let timeout = Duration::from_millis(limits.timeout_ms);
    let cpu_limit = Duration::from_millis(limits.cpu_limit_ms);
    let tripwires = Arc::new(Tripwires::default());
    let watchdog_trips = tripwires.clone();
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        let started = Instant::now();
        let cpu_start = process_cpu_time();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            match cancel_rx.recv_timeout(remaining.min(WATCHDOG_TICK)) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            }
            if started.elapsed() >= timeout {
                watchdog_trips.wall.store(true, Ordering::SeqCst);
                watchdog_handle.terminate_execution();
                return;
            }
            if let (Some(start), Some(now)) = (cpu_start, process_cpu_time()) {
                if now.saturating_sub(start) >= cpu_limit {
                    watchdog_trips.cpu.store(true, Ordering::SeqCst);
                    watchdog_handle.terminate_execution();
                    return;
                }
            }
        }
    });

    let mut event_loop_timed_out = false;
    let exec_error = match runtime.execute_script("[codemode:script]", wrap_script(script)) {
        Ok(_) => {
            match tokio::time::timeout(
                timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    event_loop_timed_out = true;
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // Join before the isolate handle can outlive the runtime.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(SandboxError::MemoryLimitExceeded {
            limit_mb: limits.memory_limit_mb,
        });
    }
    if tripwires.cpu.load(Ordering::SeqCst) {
        return Err(SandboxError::CpuLimitExceeded {
            limit_ms: limits.cpu_limit_ms,
        });
    }
    if tripwires.wall.load(Ordering::SeqCst) || event_loop_timed_out {
        return Err(SandboxError::Timeout {
            timeout_ms: limits.timeout_ms,
        });
    }
    if let Some(message) = exec_error {
        return Err(SandboxError::Script { message });
    }

    let result_str = {
        let state = runtime.op_state();
        let state = state.borrow();
        state
            .try_borrow::<ScriptResult>()
            .map(|r| r.0.clone())
            .ok_or_else(|| SandboxError::Script {
                message: "script did not settle before the event loop drained".into(),
            })?
    };

    if result_str.len() > limits.max_output_size {
        return Err(SandboxError::OutputTooLarge {
            max: limits.max_output_size,
        });
    }

    let envelope: Value = serde_json::from_str(&result_str)?;
    if let Some(error) = envelope.get("error") {
        return Err(SandboxError::Script {
            message: error.as_str().unwrap_or("unknown error").to_string(),
        });
    }
    Ok(envelope.get("ok").cloned().unwrap_or(Value::Null))
}

/// User plus system CPU time of this process.
#[cfg(unix)]
fn process_cpu_time() -> Option<Duration> {
    use nix::sys::resource::{getrusage, UsageWho};
    use nix::sys::time::TimeValLike;

    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let micros = usage.user_time().num_microseconds() + usage.system_time().num_microseconds();
    u64::try_from(micros).ok().map(Duration::from_micros)
}

#[cfg(not(unix))]
fn process_cpu_time() -> Option<Duration> {
    None
}

/// Peak resident set size of this process in megabytes, since it started.
#[cfg(unix)]
fn peak_memory_mb() -> Option<u64> {
    use nix::sys::resource::{getrusage, UsageWho};

    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let max_rss = u64::try_from(usage.max_rss()).ok()?;
    // ru_maxrss is bytes on macOS, kilobytes elsewhere.
    let bytes = if cfg!(target_os = "macos") {
        max_rss
    } else {
        max_rss * 1024
    };
    Some(bytes / (1024 * 1024))
}

#[cfg(not(unix))]
fn peak_memory_mb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers every call locally with what it was asked, and records logs.
    #[derive(Default)]
    struct EchoBridge {
        logs: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CallBridge for EchoBridge {
        async fn call(
            &self,
            group: Option<String>,
            method: String,
            args: Value,
        ) -> Result<Value, String> {
            if method == "fail" {
                return Err("'core.fail' failed: upstream unavailable".into());
            }
            Ok(json!({ "group": group, "method": method, "args": args }))
        }

        fn log(&self, message: &str) {
            self.logs.lock().unwrap().push(message.to_string());
        }
    }

    fn limits() -> WorkerLimits {
        WorkerLimits {
            timeout_ms: 5_000,
            memory_limit_mb: 64,
            cpu_limit_ms: 5_000,
            max_output_size: 1024 * 1024,
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }

    fn core_bindings() -> SerializedBindings {
        SerializedBindings::new()
            .with_group("core", ["readQuery", "fail"])
            .with_top_level("ping")
    }

    async fn run(script: &str, bindings: SerializedBindings, limits: WorkerLimits) -> ScriptRun {
        spawn_script(limits, script.into(), bindings, Arc::new(EchoBridge::default()))
            .unwrap()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn returns_script_value() {
        let run = run("return { answer: 6 * 7 };", SerializedBindings::new(), limits()).await;
        assert_eq!(run.result.unwrap(), json!({ "answer": 42 }));
    }

    #[tokio::test]
    async fn undefined_becomes_null() {
        let run = run("const x = 1;", SerializedBindings::new(), limits()).await;
        assert_eq!(run.result.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn thrown_errors_are_script_errors() {
        let run = run("throw new Error('boom');", SerializedBindings::new(), limits()).await;
        match run.result.unwrap_err() {
            SandboxError::Script { message } => assert_eq!(message, "boom"),
            other => panic!("expected script error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn syntax_errors_are_script_errors() {
        let run = run("return (;", SerializedBindings::new(), limits()).await;
        assert!(matches!(run.result, Err(SandboxError::Script { .. })));
    }

    #[tokio::test]
    async fn grouped_and_top_level_calls_reach_bridge() {
        let script = r#"
            const a = await core.readQuery({ sql: "select 1" });
            const b = await ping();
            return [a, b];
        "#;
        let out = run(script, core_bindings(), limits()).await.result.unwrap();
        assert_eq!(
            out,
            json!([
                { "group": "core", "method": "readQuery", "args": { "sql": "select 1" } },
                { "group": null, "method": "ping", "args": null }
            ])
        );
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently() {
        let script = r#"
            const results = await Promise.all([1, 2, 3].map((n) => core.readQuery({ n })));
            return results.map((r) => r.args.n);
        "#;
        let out = run(script, core_bindings(), limits()).await.result.unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn bridge_errors_are_catchable() {
        let script = r#"
            try {
                await core.fail({});
                return "unreachable";
            } catch (e) {
                return e.message;
            }
        "#;
        let out = run(script, core_bindings(), limits()).await.result.unwrap();
        assert!(out.as_str().unwrap().contains("upstream unavailable"), "got: {out}");
    }

    #[tokio::test]
    async fn help_lists_granted_names() {
        let script = "return [core.help(), help()];";
        let out = run(script, core_bindings(), limits()).await.result.unwrap();
        assert_eq!(
            out,
            json!([
                { "group": "core", "methods": ["readQuery", "fail"] },
                { "groups": ["core"], "methods": ["ping"] }
            ])
        );
    }

    #[tokio::test]
    async fn ungranted_groups_are_undefined() {
        let script = "return [typeof core, typeof admin];";
        let out = run(script, core_bindings(), limits()).await.result.unwrap();
        assert_eq!(out, json!(["object", "undefined"]));
    }

    #[tokio::test]
    async fn proxies_are_frozen() {
        let script = r#"
            "use strict";
            try { core.readQuery = () => 1; } catch (e) { return "frozen"; }
            return "mutable";
        "#;
        let out = run(script, core_bindings(), limits()).await.result.unwrap();
        assert_eq!(out, json!("frozen"));
    }

    #[tokio::test]
    async fn host_globals_are_absent() {
        let script = r#"
            return [typeof Deno, typeof eval, typeof process, typeof require, typeof fetch];
        "#;
        let out = run(script, SerializedBindings::new(), limits()).await.result.unwrap();
        assert_eq!(
            out,
            json!(["undefined", "undefined", "undefined", "undefined", "undefined"])
        );
    }

    #[tokio::test]
    async fn function_constructor_is_unreachable() {
        let script = "return typeof (() => {}).constructor;";
        let out = run(script, SerializedBindings::new(), limits()).await.result.unwrap();
        assert_eq!(out, json!("undefined"));
    }

    #[tokio::test]
    async fn global_function_cannot_compile_strings() {
        let script = r#"
            const attempts = [
                () => Reflect.construct(Function, ["return 1"]),
                () => new Function("return 1"),
                () => globalThis["Func" + "tion"]("return 1"),
            ];
            const outcomes = attempts.map((attempt) => {
                try {
                    attempt();
                    return "compiled";
                } catch (e) {
                    return e.name;
                }
            });
            return { outcomes, isFunction: (() => {}) instanceof Function };
        "#;
        let out = run(script, SerializedBindings::new(), limits()).await.result.unwrap();
        assert_eq!(
            out,
            json!({ "outcomes": ["EvalError", "EvalError", "EvalError"], "isFunction": true })
        );
    }

    #[tokio::test]
    async fn logs_reach_bridge() {
        let bridge = Arc::new(EchoBridge::default());
        let rx = spawn_script(
            limits(),
            "codemode.log('step 1'); codemode.log(42); return true;".into(),
            SerializedBindings::new(),
            bridge.clone(),
        )
        .unwrap();
        assert_eq!(rx.await.unwrap().result.unwrap(), json!(true));
        assert_eq!(*bridge.logs.lock().unwrap(), vec!["step 1", "42"]);
    }

    #[tokio::test]
    async fn infinite_loop_hits_wall_clock() {
        let limits = WorkerLimits {
            timeout_ms: 300,
            ..limits()
        };
        let started = Instant::now();
        let run = run("while (true) {}", SerializedBindings::new(), limits).await;
        assert!(
            matches!(run.result, Err(SandboxError::Timeout { .. }) | Err(SandboxError::CpuLimitExceeded { .. })),
            "got: {:?}",
            run.result
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn busy_loop_hits_cpu_limit() {
        let limits = WorkerLimits {
            timeout_ms: 10_000,
            cpu_limit_ms: 200,
            ..limits()
        };
        let run = run("while (true) {}", SerializedBindings::new(), limits).await;
        assert!(
            matches!(run.result, Err(SandboxError::CpuLimitExceeded { limit_ms: 200 })),
            "got: {:?}",
            run.result
        );
    }

    #[tokio::test]
    async fn heap_growth_hits_memory_limit() {
        let limits = WorkerLimits {
            memory_limit_mb: 16,
            timeout_ms: 30_000,
            cpu_limit_ms: 30_000,
            ..limits()
        };
        let script = r#"
            const arr = [];
            while (true) { arr.push(new Array(100000).fill("x")); }
        "#;
        let run = run(script, SerializedBindings::new(), limits).await;
        assert!(
            matches!(run.result, Err(SandboxError::MemoryLimitExceeded { limit_mb: 16 })),
            "got: {:?}",
            run.result
        );
    }

    #[tokio::test]
    async fn oversized_output_is_rejected() {
        let limits = WorkerLimits {
            max_output_size: 100,
            ..limits()
        };
        let run = run("return 'x'.repeat(1000);", SerializedBindings::new(), limits).await;
        assert!(matches!(run.result, Err(SandboxError::OutputTooLarge { max: 100 })));
    }

    #[tokio::test]
    async fn invalid_bindings_fail_before_running() {
        let bindings = SerializedBindings::new().with_group("JSON", ["parse"]);
        let run = run("return 1;", bindings, limits()).await;
        assert!(matches!(run.result, Err(SandboxError::InvalidBindings { .. })));
    }

    #[tokio::test]
    async fn each_run_gets_a_fresh_isolate() {
        let first = run("globalThis.leak = 1; return 1;", SerializedBindings::new(), limits()).await;
        assert!(first.result.is_ok());
        let second = run("return typeof leak;", SerializedBindings::new(), limits()).await;
        assert_eq!(second.result.unwrap(), json!("undefined"));
    }
}
