//! Pre-execution script validator.
//!
//! Defense in depth: the isolate and the host-side grant are the real
//! boundary. These checks reject obvious escape attempts before a worker is
//! involved and give the caller a clearer message than a runtime
//! `ReferenceError` would.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::SandboxError;

/// Default maximum script size in bytes (64 KB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 64 * 1024;

/// Banned constructs: (pattern, label reported to the caller).
///
/// Word boundaries keep `core.runFunction(...)` or `data.process.status` legal.
static BANNED: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\beval\s*\(", "eval("),
        (r"\bFunction\s*\(", "Function("),
        (r"\bimport\s*\(", "import("),
        (r"\brequire\s*\(", "require("),
        (r"\bDeno\s*\.", "Deno."),
        (r"__proto__", "__proto__"),
        (r"\bconstructor\s*\[", "constructor["),
        (r"\bconstructor\s*\.\s*constructor\b", "constructor.constructor"),
        (r"\bReflect\s*\.", "Reflect."),
        (r"\bglobalThis\s*\[", "globalThis["),
        (r"\bString\s*\.\s*fromCharCode\b", "String.fromCharCode"),
        (
            r"(?:^|[^\w.$])process\s*\.\s*(env|exit|argv|stdin|stdout|stderr|kill|binding)\b",
            "process.*",
        ),
    ]
    .into_iter()
    .map(|(pattern, label)| {
        (
            Regex::new(pattern).expect("banned patterns are valid"),
            label,
        )
    })
    .collect()
});

/// Validate a script before it is sent to a worker.
pub fn validate_script(script: &str, max_size: usize) -> Result<(), SandboxError> {
    if script.len() > max_size {
        return Err(SandboxError::ScriptTooLarge {
            max: max_size,
            actual: script.len(),
        });
    }

    if script.trim().is_empty() {
        return Err(SandboxError::ValidationFailed {
            reason: "script is empty".into(),
        });
    }

    if let Some((_, label)) = BANNED.iter().find(|(re, _)| re.is_match(script)) {
        return Err(SandboxError::BannedPattern {
            pattern: (*label).to_string(),
        });
    }

    Ok(())
}
