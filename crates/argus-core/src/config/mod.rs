use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{EngineConfig, GeneralConfig, ProviderManagerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate an `EngineConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(EngineConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate an `EngineConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let g = &config.general;

    if g.default_node_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "general.default_node_timeout_seconds must be > 0".to_string(),
        });
    }

    if g.max_concurrent_executions == 0 {
        return Err(ConfigError::Validation {
            message: "general.max_concurrent_executions must be > 0".to_string(),
        });
    }

    if g.max_execution_history == 0 {
        return Err(ConfigError::Validation {
            message: "general.max_execution_history must be > 0".to_string(),
        });
    }

    let p = &config.provider;

    if p.circuit_breaker_failure_threshold == 0 {
        return Err(ConfigError::Validation {
            message: "provider.circuit_breaker_failure_threshold must be > 0".to_string(),
        });
    }

    if p.default_max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "provider.default_max_attempts must be > 0".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = EngineConfig::default();
        validate(&config).unwrap();
    }

    #[test]
    fn minimal_toml_parses_to_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.general.default_node_timeout_seconds, 300);
        assert_eq!(config.general.max_concurrent_executions, 50);
        assert_eq!(config.provider.circuit_breaker_failure_threshold, 5);
        assert_eq!(config.provider.circuit_breaker_half_open_seconds, 600);
        assert_eq!(config.provider.rate_limit_cooldown_seconds, 300);
    }

    #[test]
    fn full_example_config_parses() {
        let data = r#"
[general]
default_node_timeout_seconds = 120
max_concurrent_executions = 10
max_execution_history = 100
timeout_monitor_interval_seconds = 15
cleanup_interval_seconds = 1800
stuck_execution_threshold_seconds = 7200
subprocess_default_timeout_seconds = 900
shutdown_grace_seconds = 10

[provider]
circuit_breaker_failure_threshold = 3
circuit_breaker_half_open_seconds = 120
rate_limit_cooldown_seconds = 60
default_max_attempts = 2
"#;

        let config = parse_config(data).unwrap();
        assert_eq!(config.general.default_node_timeout_seconds, 120);
        assert_eq!(config.general.max_concurrent_executions, 10);
        assert_eq!(config.general.stuck_execution_threshold_seconds, 7200);
        assert_eq!(config.provider.circuit_breaker_failure_threshold, 3);
        assert_eq!(config.provider.circuit_breaker_half_open_seconds, 120);
        assert_eq!(config.provider.rate_limit_cooldown_seconds, 60);
        assert_eq!(config.provider.default_max_attempts, 2);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let data = r#"
[general]
max_concurrent_executions = 5
"#;
        let config = parse_config(data).unwrap();
        assert_eq!(config.general.max_concurrent_executions, 5);
        assert_eq!(config.general.default_node_timeout_seconds, 300);
    }

    #[test]
    fn zero_timeout_rejected() {
        let data = r#"
[general]
default_node_timeout_seconds = 0
"#;
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("default_node_timeout_seconds"));
    }

    #[test]
    fn zero_failure_threshold_rejected() {
        let data = r#"
[provider]
circuit_breaker_failure_threshold = 0
"#;
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("circuit_breaker_failure_threshold"));
    }

    #[test]
    fn unknown_field_in_toml_returns_parse_error() {
        let data = r#"
[general]
nonexistent_field = "bad"
"#;
        let err = parse_config(data).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = load_config(Path::new("/tmp/nonexistent-argus-test.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
