// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmcp-reliability-config
#![deny(unsafe_code)]
//!
//! Configuration surface for the reliability layer: defaults, TOML
//! parsing, environment overrides, validation, and layered merge.

use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ceiling for per-call timeouts, in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = 600_000;
/// 10 MiB, the default `max_message_size`.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;
/// 1 KiB, the floor of the `max_message_size` range.
pub const MIN_MESSAGE_SIZE: u64 = 1024;
/// 1 GiB, the ceiling of the `max_message_size` range.
pub const MAX_MESSAGE_SIZE: u64 = 1024 * 1024 * 1024;
/// Above this fraction of `MAX_TIMEOUT_MS`, `validate_config` emits a
/// [`ConfigWarning::LargeTimeout`] rather than rejecting the value outright.
const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 300_000;

/// Errors that prevent a configuration from being loaded or accepted at all.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to parse configuration: {reason}")]
    ParseError { reason: String },

    #[error("configuration failed validation: {}", .reasons.join("; "))]
    ValidationError { reasons: Vec<String> },
}

/// Non-fatal configuration concerns surfaced alongside a valid config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    DeprecatedField {
        field: String,
        suggestion: Option<String>,
    },
    LargeTimeout {
        field: String,
        ms: u64,
    },
    DedupDisabled,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::DeprecatedField { field, suggestion } => {
                write!(f, "field `{field}` is deprecated")?;
                if let Some(s) = suggestion {
                    write!(f, "; use `{s}` instead")?;
                }
                Ok(())
            }
            ConfigWarning::LargeTimeout { field, ms } => {
                write!(f, "`{field}` is set to {ms}ms, which is unusually large")
            }
            ConfigWarning::DedupDisabled => {
                write!(f, "`deduplication_capacity` is 0; the dedup cache is disabled")
            }
        }
    }
}

/// Retry policy defaults and bounds, nested under `[retry]` in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
            retry_on_timeout: true,
        }
    }
}

/// The full reliability configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub default_timeout_ms: u64,
    pub max_concurrent_requests: u32,
    pub deduplication_window_ms: u64,
    pub deduplication_capacity: usize,
    pub max_message_size: u64,
    pub retry: RetryConfig,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            max_concurrent_requests: 100,
            deduplication_window_ms: 300_000,
            deduplication_capacity: 1_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

/// Parse a `ReliabilityConfig` from TOML source.
pub fn parse_toml(content: &str) -> Result<ReliabilityConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Load configuration from `path` if given, falling back to defaults,
/// then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<ReliabilityConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
                path: path.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ReliabilityConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn env_u64(name: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(name)
        && let Ok(value) = raw.parse()
    {
        *target = value;
    }
}

fn env_u32(name: &str, target: &mut u32) {
    if let Ok(raw) = std::env::var(name)
        && let Ok(value) = raw.parse()
    {
        *target = value;
    }
}

fn env_usize(name: &str, target: &mut usize) {
    if let Ok(raw) = std::env::var(name)
        && let Ok(value) = raw.parse()
    {
        *target = value;
    }
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(raw) = std::env::var(name)
        && let Ok(value) = raw.parse()
    {
        *target = value;
    }
}

fn env_f64(name: &str, target: &mut f64) {
    if let Ok(raw) = std::env::var(name)
        && let Ok(value) = raw.parse()
    {
        *target = value;
    }
}

/// Apply `RMCP_*` environment variable overrides in place.
pub fn apply_env_overrides(config: &mut ReliabilityConfig) {
    env_u64("RMCP_DEFAULT_TIMEOUT_MS", &mut config.default_timeout_ms);
    env_u32(
        "RMCP_MAX_CONCURRENT_REQUESTS",
        &mut config.max_concurrent_requests,
    );
    env_u64(
        "RMCP_DEDUPLICATION_WINDOW_MS",
        &mut config.deduplication_window_ms,
    );
    env_usize(
        "RMCP_DEDUPLICATION_CAPACITY",
        &mut config.deduplication_capacity,
    );
    env_u64("RMCP_MAX_MESSAGE_SIZE", &mut config.max_message_size);
    env_u32("RMCP_RETRY_MAX_ATTEMPTS", &mut config.retry.max_attempts);
    env_u64("RMCP_RETRY_BASE_DELAY_MS", &mut config.retry.base_delay_ms);
    env_u64("RMCP_RETRY_MAX_DELAY_MS", &mut config.retry.max_delay_ms);
    env_f64(
        "RMCP_RETRY_BACKOFF_MULTIPLIER",
        &mut config.retry.backoff_multiplier,
    );
    env_bool("RMCP_RETRY_JITTER", &mut config.retry.jitter);
    env_bool(
        "RMCP_RETRY_RETRY_ON_TIMEOUT",
        &mut config.retry.retry_on_timeout,
    );
}

/// Validate a configuration against the documented ranges for each field.
///
/// Returns hard [`ConfigError::ValidationError`] for out-of-range values
/// and a list of soft [`ConfigWarning`]s for valid-but-risky ones.
pub fn validate_config(config: &ReliabilityConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut reasons = Vec::new();
    let mut warnings = Vec::new();

    if !(1..=MAX_TIMEOUT_MS).contains(&config.default_timeout_ms) {
        reasons.push(format!(
            "default_timeout_ms must be in [1, {MAX_TIMEOUT_MS}], got {}",
            config.default_timeout_ms
        ));
    } else if config.default_timeout_ms >= LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeTimeout {
            field: "default_timeout_ms".to_string(),
            ms: config.default_timeout_ms,
        });
    }

    if !(1..=10_000).contains(&config.max_concurrent_requests) {
        reasons.push(format!(
            "max_concurrent_requests must be in [1, 10000], got {}",
            config.max_concurrent_requests
        ));
    }

    if config.deduplication_window_ms > 3_600_000 {
        reasons.push(format!(
            "deduplication_window_ms must be in [0, 3600000], got {}",
            config.deduplication_window_ms
        ));
    }

    if config.deduplication_capacity > 1_000_000 {
        reasons.push(format!(
            "deduplication_capacity must be in [0, 1000000], got {}",
            config.deduplication_capacity
        ));
    } else if config.deduplication_capacity == 0 {
        warnings.push(ConfigWarning::DedupDisabled);
    }

    if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&config.max_message_size) {
        reasons.push(format!(
            "max_message_size must be in [{MIN_MESSAGE_SIZE}, {MAX_MESSAGE_SIZE}], got {}",
            config.max_message_size
        ));
    }

    if !(1..=100).contains(&config.retry.max_attempts) {
        reasons.push(format!(
            "retry.max_attempts must be in [1, 100], got {}",
            config.retry.max_attempts
        ));
    }

    if !(1..=60_000).contains(&config.retry.base_delay_ms) {
        reasons.push(format!(
            "retry.base_delay_ms must be in [1, 60000], got {}",
            config.retry.base_delay_ms
        ));
    }

    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        reasons.push(format!(
            "retry.max_delay_ms ({}) must be >= retry.base_delay_ms ({})",
            config.retry.max_delay_ms, config.retry.base_delay_ms
        ));
    }

    if !(1.0..=10.0).contains(&config.retry.backoff_multiplier) {
        reasons.push(format!(
            "retry.backoff_multiplier must be in [1.0, 10.0], got {}",
            config.retry.backoff_multiplier
        ));
    }

    if !reasons.is_empty() {
        return Err(ConfigError::ValidationError { reasons });
    }

    Ok(warnings)
}

/// Merge `overlay` onto `base`: every overlay field wins unconditionally.
///
/// Used to layer a file-loaded config (`base`) under environment/CLI
/// overrides already captured in a second `ReliabilityConfig` (`overlay`).
#[must_use]
pub fn merge_configs(_base: &ReliabilityConfig, overlay: ReliabilityConfig) -> ReliabilityConfig {
    overlay
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_config_is_valid() {
        let config = ReliabilityConfig::default();
        let warnings = validate_config(&config).expect("defaults must validate");
        assert!(warnings.is_empty());
    }

    #[test]
    fn parse_toml_partial_overrides_keep_defaults() {
        let config = parse_toml("default_timeout_ms = 5000\n").unwrap();
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.max_concurrent_requests, 100);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn parse_toml_nested_retry_section() {
        let toml = "[retry]\nmax_attempts = 5\nbase_delay_ms = 200\n";
        let config = parse_toml(toml).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(config.retry.max_delay_ms, 60_000);
    }

    #[test]
    fn parse_toml_rejects_bad_syntax() {
        let err = parse_toml("not valid [[[ toml").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_timeout() {
        let mut config = ReliabilityConfig::default();
        config.default_timeout_ms = 0;
        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("default_timeout_ms")));
            }
            _ => panic!("expected ValidationError"),
        }
    }

    #[test]
    fn validate_rejects_max_delay_below_base_delay() {
        let mut config = ReliabilityConfig::default();
        config.retry.base_delay_ms = 5_000;
        config.retry.max_delay_ms = 1_000;
        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("max_delay_ms")));
            }
            _ => panic!("expected ValidationError"),
        }
    }

    #[test]
    fn validate_warns_on_large_timeout() {
        let mut config = ReliabilityConfig::default();
        config.default_timeout_ms = 500_000;
        let warnings = validate_config(&config).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeTimeout { .. })));
    }

    #[test]
    fn validate_warns_on_zero_capacity() {
        let mut config = ReliabilityConfig::default();
        config.deduplication_capacity = 0;
        let warnings = validate_config(&config).unwrap();
        assert!(warnings.contains(&ConfigWarning::DedupDisabled));
    }

    #[test]
    fn env_overrides_apply() {
        // SAFETY: test runs single-threaded within this crate's test binary
        // and restores the variable before returning.
        unsafe {
            std::env::set_var("RMCP_RETRY_MAX_ATTEMPTS", "7");
        }
        let mut config = ReliabilityConfig::default();
        apply_env_overrides(&mut config);
        unsafe {
            std::env::remove_var("RMCP_RETRY_MAX_ATTEMPTS");
        }
        assert_eq!(config.retry.max_attempts, 7);
    }

    #[test]
    fn merge_overlay_wins() {
        let base = ReliabilityConfig::default();
        let mut overlay = ReliabilityConfig::default();
        overlay.max_concurrent_requests = 5;
        let merged = merge_configs(&base, overlay);
        assert_eq!(merged.max_concurrent_requests, 5);
    }

    #[test]
    fn load_config_missing_file_errors() {
        let err = load_config(Some(Path::new("/nonexistent/rmcp.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_config_from_tempfile() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_requests = 42").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.max_concurrent_requests, 42);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut config = ReliabilityConfig::default();
        config.retry.backoff_multiplier = 3.5;
        let serialized = toml::to_string(&config).unwrap();
        let back: ReliabilityConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(back, config);
    }

    proptest! {
        #[test]
        fn any_config_passing_validation_roundtrips_through_toml(
            default_timeout_ms in 1u64..=600_000,
            max_concurrent_requests in 1u32..=10_000,
            max_attempts in 1u32..=100,
            base_delay_ms in 1u64..=60_000,
            backoff_multiplier in 1.0f64..=10.0,
        ) {
            let config = ReliabilityConfig {
                default_timeout_ms,
                max_concurrent_requests,
                retry: RetryConfig {
                    max_attempts,
                    base_delay_ms,
                    max_delay_ms: base_delay_ms.max(60_000),
                    backoff_multiplier,
                    ..RetryConfig::default()
                },
                ..ReliabilityConfig::default()
            };
            prop_assert!(validate_config(&config).is_ok());
            let serialized = toml::to_string(&config).unwrap();
            let back: ReliabilityConfig = toml::from_str(&serialized).unwrap();
            prop_assert_eq!(back, config);
        }
    }
}
