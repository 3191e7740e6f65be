use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Selection strategy for choosing the next provider to try (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Priority,
    RoundRobin,
    Intelligent,
    Fastest,
}

/// Derived health status of a provider (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Failed,
    Testing,
    Unknown,
    RateLimited,
    Throttled,
}

/// Static configuration for one configured backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub base_url: String,
    pub model: String,
    /// Lower sorts first under the `priority` strategy.
    pub priority: i32,
    pub timeout_seconds: u64,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// Mutable runtime counters tracked per provider (spec §3).
#[derive(Debug, Clone)]
pub struct ProviderRuntime {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    /// Exponential average per spec §9: `avg = (avg + elapsed) / 2`. `None`
    /// until the first successful call seeds it.
    pub avg_response_time_secs: Option<f64>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub rate_limit_until: Option<DateTime<Utc>>,
    pub status: ProviderStatus,
}

impl Default for ProviderRuntime {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_response_time_secs: None,
            last_used: None,
            last_error: None,
            rate_limit_until: None,
            status: ProviderStatus::Unknown,
        }
    }
}

impl ProviderRuntime {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.5
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn speed_factor(&self) -> f64 {
        match self.avg_response_time_secs {
            Some(t) => 1.0 / (t + 0.1),
            None => 1.0,
        }
    }
}

/// A request to generate a response from a remote backend.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub options: HashMap<String, String>,
}

/// The outcome of one `Generate` dispatch across the fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub content: Option<String>,
    pub provider_id: Option<String>,
    pub provider_name: Option<String>,
    pub tokens_used: Option<u64>,
    pub response_time_seconds: f64,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Global counters owned by the manager (spec §3 `ProviderStats`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_fallbacks: u64,
    pub total_response_time_seconds: f64,
}

impl ProviderStats {
    pub fn average_response_time(&self) -> f64 {
        if self.successful_requests == 0 {
            0.0
        } else {
            self.total_response_time_seconds / self.successful_requests as f64
        }
    }
}

/// Per-provider snapshot returned by `ProviderHealth()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthEntry {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub status: ProviderStatus,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_response_time_secs: Option<f64>,
    pub last_error: Option<String>,
}
