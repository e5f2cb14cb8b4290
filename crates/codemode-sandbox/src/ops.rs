//! deno_core op definitions for the codemode sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::CallBridge;

/// Forward a `codemode.log()` line to the bridge.
#[op2(fast)]
pub fn op_codemode_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(bridge) = state.try_borrow::<Arc<dyn CallBridge>>() {
        bridge.log(msg);
    }
}

/// Store the script's result envelope in OpState.
#[op2(fast)]
pub fn op_codemode_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ScriptResult(json.to_string()));
}

/// Issue a capability call through the bridge.
///
/// `group` is the empty string for top-level methods. Permission checks and
/// call budgets are enforced by the host, not here.
#[op2(async)]
#[string]
pub async fn op_codemode_call(
    op_state: Rc<RefCell<OpState>>,
    #[string] group: String,
    #[string] method: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(
        group = %group,
        method = %method,
        args_len = args_json.len(),
        "capability call issued"
    );

    let bridge = {
        let st = op_state.borrow();
        st.borrow::<Arc<dyn CallBridge>>().clone()
    };

    let args: serde_json::Value = serde_json::from_str(&args_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid JSON args: {e}")))?;
    let group = (!group.is_empty()).then_some(group);

    let result = bridge
        .call(group, method, args)
        .await
        .map_err(JsErrorBox::generic)?;

    serde_json::to_string(&result)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

/// The result envelope (`{ok}` or `{error}` JSON) written by the script wrapper.
pub struct ScriptResult(pub String);

deno_core::extension!(
    codemode_ext,
    ops = [op_codemode_log, op_codemode_set_result, op_codemode_call],
);
