//! Worker-side proxy.
//!
//! [`build_bootstrap`] turns [`SerializedBindings`] into the JavaScript that
//! installs one frozen object per group (plus top-level functions and `help()`)
//! in a fresh isolate. Every proxy method funnels into `op_codemode_call`, which
//! hands the call to the worker's bridge; [`PendingCalls`] then correlates the
//! host's responses with the promises the script is awaiting.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::bindings::SerializedBindings;
use crate::error::SandboxError;

/// Receives the response for one outstanding call.
pub type CallWaiter = oneshot::Sender<Result<Value, String>>;

/// Outstanding calls of one execution, keyed by request id.
///
/// Ids start at 0 and increase monotonically; each id is answered at most once.
#[derive(Debug, Default)]
pub struct PendingCalls {
    next_id: u64,
    waiters: HashMap<u64, CallWaiter>,
}

impl PendingCalls {
    /// Create an empty table. Ids restart at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and park `waiter` under it.
    pub fn register(&mut self, waiter: CallWaiter) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.waiters.insert(id, waiter);
        id
    }

    /// Settle the call with `id`.
    ///
    /// Returns `false` when no call with that id is outstanding; the response
    /// is dropped.
    pub fn resolve(&mut self, id: u64, result: Result<Value, String>) -> bool {
        match self.waiters.remove(&id) {
            Some(waiter) => {
                // The script may have stopped waiting; nothing to do then.
                let _ = waiter.send(result);
                true
            }
            None => {
                tracing::debug!(id, "dropping response for unknown call id");
                false
            }
        }
    }

    /// Drop every outstanding waiter, rejecting the corresponding promises.
    pub fn abandon_all(&mut self) -> usize {
        let n = self.waiters.len();
        self.waiters.clear();
        n
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// True when no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Build the bootstrap script for the given bindings.
///
/// Installs the group proxies, top-level functions, `help()` and `codemode.log`,
/// then removes `Deno` and `eval`, clears the `constructor` of every function
/// prototype and replaces the global `Function` with a stub that throws
/// `EvalError`. Names are validated first, so the embedded JSON only ever
/// holds identifiers.
pub fn build_bootstrap(bindings: &SerializedBindings) -> Result<String, SandboxError> {
    bindings.validate()?;
    let bindings_json = serde_json::to_string(bindings)?;

    Ok(format!(
        r#"((ops, bindings) => {{
    const callOp = ops.op_codemode_call;
    const setResult = (json) => ops.op_codemode_set_result(json);
    const log = (msg) => ops.op_codemode_log(String(msg));

    const invoke = async (group, method, args) => {{
        const argsJson = JSON.stringify(args === undefined ? null : args);
        const resultJson = await callOp(group, method, argsJson === undefined ? "null" : argsJson);
        return JSON.parse(resultJson);
    }};
    const install = (name, value) => Object.defineProperty(globalThis, name, {{
        value, writable: false, configurable: false, enumerable: true,
    }});

    const groupNames = Object.freeze(Object.keys(bindings.groups));
    for (const group of groupNames) {{
        const methods = Object.freeze([...bindings.groups[group]]);
        const proxy = {{}};
        for (const method of methods) {{
            proxy[method] = (args) => invoke(group, method, args);
        }}
        proxy.help = () => ({{ group, methods: [...methods] }});
        install(group, Object.freeze(proxy));
    }}
    const topLevel = Object.freeze([...bindings.top_level]);
    for (const method of topLevel) {{
        install(method, (args) => invoke("", method, args));
    }}
    install("help", () => ({{ groups: [...groupNames], methods: [...topLevel] }}));
    install("codemode", Object.freeze({{ __setResult: setResult, log }}));

    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function(){{}}).constructor;
    const GeneratorFunction = (function*(){{}}).constructor;
    const AsyncGeneratorFunction = (async function*(){{}}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {{
        Object.defineProperty(ctor.prototype, 'constructor', {{
            value: undefined, configurable: false, writable: false
        }});
    }}
    const blockedFunction = function Function() {{
        throw new EvalError("code generation from strings is disabled");
    }};
    blockedFunction.prototype = Function.prototype;
    Object.defineProperty(globalThis, 'Function', {{
        value: Object.freeze(blockedFunction), writable: false, configurable: false, enumerable: false,
    }});
}})(Deno.core.ops, {bindings_json});"#
    ))
}

/// Wrap a script body as the body of an async function and report its outcome.
///
/// The return value is reported as `{ok}` (`undefined` becomes `null`), a
/// thrown value as `{error}`.
pub fn wrap_script(script: &str) -> String {
    format!(
        r#"(async () => {{
    const __setResult = codemode.__setResult;
    try {{
        const __result = await (async () => {{
{script}
        }})();
        __setResult(JSON.stringify({{ ok: __result === undefined ? null : __result }}));
    }} catch (e) {{
        __setResult(JSON.stringify({{ error: (e && e.message) ? String(e.message) : String(e) }}));
    }}
}})();"#
    )
}
