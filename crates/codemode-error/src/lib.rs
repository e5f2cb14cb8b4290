//! Typed error types for the codemode capability surface.
//!
//! Provides [`DispatchError`], the canonical error type returned by every
//! capability call a sandboxed script makes through the host-side dispatcher.

use thiserror::Error;

/// Canonical error type for capability dispatch.
///
/// The enum is `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The requested group does not exist on the capability surface.
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// The requested method does not exist on the capability surface.
    #[error("method not found: '{method}'")]
    MethodNotFound {
        /// Fully qualified method name (`group.method` or `method`).
        method: String,
    },

    /// The method exists but was not granted to this execution.
    #[error("not permitted: {method}")]
    NotPermitted {
        /// Fully qualified method name that was requested.
        method: String,
    },

    /// The arguments were rejected before reaching the operation.
    #[error("invalid arguments for '{method}': {reason}")]
    InvalidArguments {
        /// Fully qualified method name.
        method: String,
        /// Why the arguments were rejected.
        reason: String,
    },

    /// The operation timed out.
    #[error("timeout after {timeout_ms}ms calling '{method}'")]
    Timeout {
        /// Fully qualified method name.
        method: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The underlying system (database, service) reported a failure.
    #[error("'{method}' failed: {message}")]
    Upstream {
        /// Fully qualified method name.
        method: String,
        /// The error message from the underlying system.
        message: String,
    },

    /// A per-execution call budget was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Render a capability target as `group.method`, or `method` when ungrouped.
pub fn qualified_name(group: Option<&str>, method: &str) -> String {
    match group {
        Some(group) => format!("{group}.{method}"),
        None => method.to_string(),
    }
}

impl DispatchError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::GroupNotFound(_) => "GROUP_NOT_FOUND",
            Self::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            Self::NotPermitted { .. } => "NOT_PERMITTED",
            Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Upstream { .. } => true,
            Self::GroupNotFound(_) => false,
            Self::MethodNotFound { .. } => false,
            Self::NotPermitted { .. } => false,
            Self::InvalidArguments { .. } => false,
            Self::RateLimit(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// A hint for fixing the call, if one applies.
    ///
    /// For unknown or ungranted names the hint is found by fuzzy matching
    /// against `known`, a list of `(group, method)` pairs where top-level
    /// methods use an empty group.
    pub fn suggested_fix(&self, known: Option<&[(&str, &str)]>) -> Option<String> {
        match self {
            Self::MethodNotFound { method } => known.and_then(|k| find_similar_method(method, k)),
            Self::GroupNotFound(group) => known.and_then(|k| find_similar_group(group, k)),
            Self::NotPermitted { method } => known
                .and_then(|k| find_similar_method(method, k))
                .or_else(|| {
                    Some("Call help() to list the methods available to this script".to_string())
                }),
            Self::Timeout { .. } => Some("Retry with a smaller request".to_string()),
            Self::Upstream { .. } => Some("Check the arguments and retry".to_string()),
            _ => None,
        }
    }

    /// Convert to a structured JSON error object.
    ///
    /// Returns a JSON object with `error`, `code`, `message`, `retryable`,
    /// and optionally `suggested_fix` (see [`DispatchError::suggested_fix`]).
    pub fn to_structured_error(&self, known: Option<&[(&str, &str)]>) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = self.suggested_fix(known) {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }

    /// One-line message for a script, with a "did you mean" hint when
    /// `known` holds a close name.
    pub fn to_script_message(&self, known: &[(&str, &str)]) -> String {
        let hint = match self {
            Self::MethodNotFound { method } | Self::NotPermitted { method } => {
                find_similar_method(method, known)
            }
            Self::GroupNotFound(group) => find_similar_group(group, known),
            _ => None,
        };
        match hint {
            Some(hint) => format!("{self}. {hint}"),
            None => self.to_string(),
        }
    }
}

/// Find the closest qualified method name within edit distance 3.
fn find_similar_method(method: &str, known: &[(&str, &str)]) -> Option<String> {
    let mut best: Option<(usize, String)> = None;

    for &(g, m) in known {
        let candidate = if g.is_empty() {
            m.to_string()
        } else {
            format!("{g}.{m}")
        };
        let dist = strsim::levenshtein(method, &candidate);
        if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
            best = Some((dist, format!("Did you mean '{candidate}'?")));
        }
    }

    best.map(|(_, suggestion)| suggestion)
}

fn find_similar_group(group: &str, known: &[(&str, &str)]) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
    let mut best: Option<(usize, String)> = None;

    for &(g, _) in known {
        if g.is_empty() || !seen.insert(g) {
            continue;
        }
        let dist = strsim::levenshtein(group, g);
        if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
            best = Some((dist, format!("Did you mean group '{g}'?")));
        }
    }

    best.map(|(_, suggestion)| suggestion)
}

// DispatchError crosses task boundaries on the host side.
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<DispatchError>();
};
