#![warn(missing_docs)]

//! # codemode-config
//!
//! Configuration loading for the codemode sandbox pool.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every setting is optional; unset values fall back to the defaults of the
//! sandbox crate.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! memory_limit_mb = 64
//! timeout_ms = 5000
//! cpu_limit_ms = 2000
//! max_calls = 100
//! worker_bin = "${CODEMODE_HOME}/bin/codemode-worker"
//!
//! [pool]
//! min_instances = 1
//! max_instances = 8
//! idle_timeout_ms = 60000
//! acquire_timeout_ms = 30000
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level codemode configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodemodeConfig {
    /// Per-sandbox resource limits.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Sandbox pool sizing.
    #[serde(default)]
    pub pool: PoolOverrides,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// V8 heap ceiling per execution, in megabytes.
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    /// Wall-clock ceiling per execution, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// CPU-time ceiling per execution, in milliseconds.
    #[serde(default)]
    pub cpu_limit_ms: Option<u64>,

    /// Maximum capability calls per execution.
    #[serde(default)]
    pub max_calls: Option<usize>,

    /// Maximum serialized size of one call's arguments, in kilobytes.
    #[serde(default)]
    pub max_call_args_size_kb: Option<usize>,

    /// Maximum serialized size of a script's output, in kilobytes.
    #[serde(default)]
    pub max_output_size_kb: Option<usize>,

    /// Maximum script size, in kilobytes.
    #[serde(default)]
    pub max_script_size_kb: Option<usize>,

    /// Maximum IPC frame size between host and worker, in megabytes.
    #[serde(default)]
    pub max_ipc_message_size_mb: Option<usize>,

    /// Explicit path to the `codemode-worker` binary.
    #[serde(default)]
    pub worker_bin: Option<PathBuf>,
}

/// Pool configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolOverrides {
    /// Sandboxes kept warm at all times.
    #[serde(default)]
    pub min_instances: Option<usize>,

    /// Hard ceiling on live sandboxes.
    #[serde(default)]
    pub max_instances: Option<usize>,

    /// Idle sandboxes above the minimum are disposed after this long.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,

    /// How long `acquire()` may queue before failing with pool exhaustion.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    /// Interval of the background eviction/backfill task.
    #[serde(default)]
    pub reap_interval_ms: Option<u64>,
}

impl CodemodeConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: CodemodeConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "loading codemode config");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "loading codemode config");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        for (name, value) in [
            ("sandbox.memory_limit_mb", sandbox.memory_limit_mb),
            ("sandbox.timeout_ms", sandbox.timeout_ms),
            ("sandbox.cpu_limit_ms", sandbox.cpu_limit_ms),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("sandbox.max_call_args_size_kb", sandbox.max_call_args_size_kb),
            ("sandbox.max_output_size_kb", sandbox.max_output_size_kb),
            ("sandbox.max_script_size_kb", sandbox.max_script_size_kb),
            ("sandbox.max_ipc_message_size_mb", sandbox.max_ipc_message_size_mb),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if let Some(bin) = &sandbox.worker_bin {
            if !bin.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.worker_bin must be an absolute path, got: {}",
                    bin.display()
                )));
            }
        }

        let pool = &self.pool;
        if pool.max_instances == Some(0) {
            return Err(ConfigError::Invalid(
                "pool.max_instances must be at least 1".into(),
            ));
        }
        if let (Some(min), Some(max)) = (pool.min_instances, pool.max_instances) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "pool.min_instances ({min}) exceeds pool.max_instances ({max})"
                )));
            }
        }
        if pool.reap_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "pool.reap_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders are kept verbatim.
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_empty_is_valid() {
        let config = CodemodeConfig::from_toml("").unwrap();
        assert!(config.sandbox.timeout_ms.is_none());
        assert!(config.pool.max_instances.is_none());
    }

    #[test]
    fn config_parses_sandbox_limits() {
        let toml = r#"
            [sandbox]
            memory_limit_mb = 128
            timeout_ms = 2500
            cpu_limit_ms = 1000
            max_calls = 20
            max_ipc_message_size_mb = 16
        "#;

        let config = CodemodeConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.max_ipc_message_size_mb, Some(16));
        assert_eq!(config.sandbox.memory_limit_mb, Some(128));
        assert_eq!(config.sandbox.timeout_ms, Some(2500));
        assert_eq!(config.sandbox.cpu_limit_ms, Some(1000));
        assert_eq!(config.sandbox.max_calls, Some(20));
    }

    #[test]
    fn config_parses_pool() {
        let toml = r#"
            [pool]
            min_instances = 0
            max_instances = 3
            idle_timeout_ms = 1000
            acquire_timeout_ms = 250
        "#;

        let config = CodemodeConfig::from_toml(toml).unwrap();
        assert_eq!(config.pool.min_instances, Some(0));
        assert_eq!(config.pool.max_instances, Some(3));
        assert_eq!(config.pool.idle_timeout_ms, Some(1000));
        assert_eq!(config.pool.acquire_timeout_ms, Some(250));
    }

    #[test]
    fn config_rejects_zero_limits() {
        for field in [
            "memory_limit_mb",
            "timeout_ms",
            "cpu_limit_ms",
            "max_ipc_message_size_mb",
        ] {
            let toml = format!("[sandbox]\n{field} = 0\n");
            let err = CodemodeConfig::from_toml(&toml).unwrap_err();
            assert!(
                err.to_string().contains(field),
                "error should name {field}: {err}"
            );
        }
    }

    #[test]
    fn config_rejects_min_above_max() {
        let toml = r#"
            [pool]
            min_instances = 4
            max_instances = 2
        "#;

        let err = CodemodeConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn config_rejects_zero_max_instances() {
        let err = CodemodeConfig::from_toml("[pool]\nmax_instances = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_instances"));
    }

    #[test]
    fn config_rejects_relative_worker_bin() {
        let err =
            CodemodeConfig::from_toml("[sandbox]\nworker_bin = \"bin/worker\"\n").unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let err = CodemodeConfig::from_toml("[sandbox]\nheap = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("CODEMODE_TEST_WORKER_DIR", "/opt/codemode");
        let toml = r#"
            [sandbox]
            worker_bin = "${CODEMODE_TEST_WORKER_DIR}/codemode-worker"
        "#;

        let config = CodemodeConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.sandbox.worker_bin.as_deref(),
            Some(Path::new("/opt/codemode/codemode-worker"))
        );
        std::env::remove_var("CODEMODE_TEST_WORKER_DIR");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codemode.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            timeout_ms = 750

            [pool]
            max_instances = 2
        "#,
        )
        .unwrap();

        let config = CodemodeConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(750));
        assert_eq!(config.pool.max_instances, Some(2));
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CodemodeConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        assert_eq!(expand_env_vars("no variables here"), "no variables here");
    }
}
