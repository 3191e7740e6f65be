use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `argus.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub general: GeneralConfig,
    pub provider: ProviderManagerConfig,
}

/// Scheduler-wide timing and capacity settings (spec §4.4, §5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeneralConfig {
    /// Fallback per-node timeout used when a node omits `timeout_seconds`.
    pub default_node_timeout_seconds: u64,
    /// Upper bound on concurrently RUNNING executions (spec §5 backpressure).
    pub max_concurrent_executions: usize,
    /// Hard cap on the completed-execution history buffer (spec §4.4.8).
    pub max_execution_history: usize,
    /// Timeout monitor loop tick interval (spec §4.4.6 — default 30s).
    pub timeout_monitor_interval_seconds: u64,
    /// Cleanup loop tick interval (spec §4.4.7 — default 1h).
    pub cleanup_interval_seconds: u64,
    /// Age after which a still-RUNNING execution is declared stuck (spec
    /// §4.4.7 — default 4h).
    pub stuck_execution_threshold_seconds: u64,
    /// Bound on a SUBPROCESS node's wait for its nested execution (spec
    /// §4.4.2 — default 1h).
    pub subprocess_default_timeout_seconds: u64,
    /// Grace period `Stop()` allows in-flight work to drain (spec §6.4).
    pub shutdown_grace_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_seconds: 300,
            max_concurrent_executions: 50,
            max_execution_history: 500,
            timeout_monitor_interval_seconds: 30,
            cleanup_interval_seconds: 3600,
            stuck_execution_threshold_seconds: 4 * 3600,
            subprocess_default_timeout_seconds: 3600,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Provider Fallback Manager constants (spec §4.3, §9).
///
/// spec.md treats these as fixed constants but explicitly allows making
/// them tunable as long as the defaults match; this config does exactly
/// that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProviderManagerConfig {
    /// Consecutive failures before a provider's circuit trips.
    pub circuit_breaker_failure_threshold: u32,
    /// Seconds after `last_used` before a tripped circuit half-opens.
    pub circuit_breaker_half_open_seconds: i64,
    /// Seconds a provider stays `RATE_LIMITED` after a rate-limit response.
    pub rate_limit_cooldown_seconds: i64,
    /// Default `max_attempts` for `Generate` calls that don't specify one.
    pub default_max_attempts: u32,
}

impl Default for ProviderManagerConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_half_open_seconds: 600,
            rate_limit_cooldown_seconds: 300,
            default_max_attempts: 3,
        }
    }
}
