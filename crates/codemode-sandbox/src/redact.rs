//! Error redaction.
//!
//! Every error string that crosses into a script, or back to the embedding
//! system in an [`ExecutionResult`](crate::ExecutionResult), goes through
//! [`redact_error_message`]. Connection strings, addresses, file paths,
//! credentials and stack frames are stripped; method names, validation
//! messages and "not found" hints survive.

use std::sync::LazyLock;

use regex::Regex;

/// Ordered rules: credentials first, since they may contain URLs.
static RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"-----BEGIN[A-Z\s]+PRIVATE KEY-----[\s\S]*?-----END[A-Z\s]+PRIVATE KEY-----",
            "[REDACTED]",
        ),
        (r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+", "[REDACTED]"),
        (r"(?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16}", "[REDACTED]"),
        (
            r"(?i)(Bearer\s+\S+|api_key\s*=\s*\S+|token\s*=\s*\S+|password\s*=\s*\S+|secret\s*=\s*\S+)",
            "[REDACTED]",
        ),
        (r"\b[0-9a-fA-F]{64,}\b", "[REDACTED]"),
        // Any scheme: http, postgres, mysql, redis, ...
        (r#"\b[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s'")\]}>]+"#, "[url]"),
        (r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?", "[addr]"),
        (r"[A-Z]:\\[\w.\\\-]+", "[path]"),
        (
            r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run|boot|snap|nix)(/[\w.\-]+)+",
            "[path]",
        ),
        (
            r"(?m)^\s*(at\s+.+|Caused by:.*|[\w.$]+Exception.*|\.{3}\s*\d+\s*more)$",
            "",
        ),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("redaction patterns are valid"),
            replacement,
        )
    })
    .collect()
});

/// Redact sensitive patterns from an error message.
///
/// - URLs and connection strings → `[url]`
/// - IP:port addresses → `[addr]`
/// - Unix/Windows file paths → `[path]`
/// - Credentials (Bearer tokens, `password=`, keys, JWTs) → `[REDACTED]`
/// - Stack trace lines → removed entirely
pub fn redact_error_message(error: &str) -> String {
    let mut msg = error.to_string();
    for (re, replacement) in RULES.iter() {
        msg = re.replace_all(&msg, *replacement).into_owned();
    }

    msg.lines()
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
