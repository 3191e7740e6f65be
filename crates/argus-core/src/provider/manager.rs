//! The Provider Fallback Manager (spec §4.3, component E).
//!
//! One [`ProviderFallbackManager`] owns a fixed roster of providers plus
//! global stats. `generate` tries up to `max_attempts` providers in the
//! order the selection strategy produces, absorbing failures into
//! per-provider state until one succeeds or the roster is exhausted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;

use super::strategy::{self, AvailableProvider};
use super::transport::ProviderTransport;
use super::types::{
    GenerateRequest, GenerateResponse, ProviderHealthEntry, ProviderRuntime, ProviderSpec,
    ProviderStats, ProviderStatus, SelectionStrategy,
};
use crate::config::ProviderManagerConfig;

struct Entry {
    spec: ProviderSpec,
    runtime: Mutex<ProviderRuntime>,
}

/// Dispatches [`GenerateRequest`]s across a roster of providers with
/// automatic fallback, per-provider circuit breaking, and rate-limit
/// back-off (spec §4.3).
pub struct ProviderFallbackManager {
    entries: Vec<Entry>,
    transport: Arc<dyn ProviderTransport>,
    config: ProviderManagerConfig,
    stats: Mutex<ProviderStats>,
    round_robin_index: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl ProviderFallbackManager {
    /// Build a manager over `providers`, sorted by ascending `priority` so
    /// the `priority` strategy and tie-breaks behave per spec §4.3.
    pub fn new(
        mut providers: Vec<ProviderSpec>,
        transport: Arc<dyn ProviderTransport>,
        config: ProviderManagerConfig,
    ) -> Self {
        providers.sort_by_key(|p| p.priority);
        let entries = providers
            .into_iter()
            .map(|spec| Entry {
                spec,
                runtime: Mutex::new(ProviderRuntime::default()),
            })
            .collect();
        Self {
            entries,
            transport,
            config,
            stats: Mutex::new(ProviderStats::default()),
            round_robin_index: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    #[cfg(test)]
    fn with_seeded_rng(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Generate a response, trying providers in `strategy` order with
    /// fallback (spec §4.3). `max_attempts` defaults to
    /// `provider.default_max_attempts` when `None`.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        strategy: SelectionStrategy,
        max_attempts: Option<u32>,
    ) -> GenerateResponse {
        {
            let mut stats = self.stats.lock().await;
            stats.total_requests += 1;
        }

        let max_attempts = max_attempts
            .unwrap_or(self.config.default_max_attempts)
            .min(self.entries.len() as u32);

        let mut tried = std::collections::HashSet::with_capacity(self.entries.len());
        let mut attempts = 0u32;
        for _ in 0..max_attempts {
            let Some(idx) = self.select_provider(strategy, &tried).await else {
                continue;
            };
            tried.insert(idx);
            attempts += 1;
            let entry = &self.entries[idx];

            let timeout = Duration::from_secs(entry.spec.timeout_seconds);
            let result = self
                .transport
                .send(&entry.spec, &request, timeout)
                .await;

            let mut runtime = entry.runtime.lock().await;
            runtime.last_used = Some(Utc::now());

            if result.ok {
                runtime.success_count += 1;
                runtime.consecutive_failures = 0;
                runtime.status = ProviderStatus::Active;
                runtime.rate_limit_until = None;

                let elapsed_secs = result.elapsed.as_secs_f64();
                runtime.avg_response_time_secs = Some(match runtime.avg_response_time_secs {
                    None => elapsed_secs,
                    Some(avg) => (avg + elapsed_secs) / 2.0,
                });
                drop(runtime);

                let mut stats = self.stats.lock().await;
                stats.successful_requests += 1;
                stats.total_response_time_seconds += elapsed_secs;
                if attempts > 1 {
                    stats.total_fallbacks += 1;
                }
                drop(stats);

                return GenerateResponse {
                    success: true,
                    content: result.content,
                    provider_id: Some(entry.spec.id.clone()),
                    provider_name: Some(entry.spec.name.clone()),
                    tokens_used: result.tokens_used,
                    response_time_seconds: elapsed_secs,
                    attempts,
                    error: None,
                };
            }

            runtime.failure_count += 1;
            runtime.consecutive_failures += 1;
            runtime.last_error = result.err.clone();
            if result.rate_limited {
                runtime.status = ProviderStatus::RateLimited;
                runtime.rate_limit_until = Some(
                    Utc::now()
                        + chrono::Duration::seconds(self.config.rate_limit_cooldown_seconds),
                );
            } else {
                runtime.status = ProviderStatus::Failed;
            }
        }

        let mut stats = self.stats.lock().await;
        stats.failed_requests += 1;

        GenerateResponse {
            success: false,
            content: None,
            provider_id: None,
            provider_name: None,
            tokens_used: None,
            response_time_seconds: 0.0,
            attempts,
            error: Some("All providers failed".to_string()),
        }
    }

    /// Selects the next provider to try, excluding both circuit-broken
    /// providers and any index already attempted earlier in this same
    /// `generate` call — a provider that just failed is never retried within
    /// the same fallback chain, even if its persistent failure count hasn't
    /// yet tripped the breaker (spec.md Scenario S5).
    async fn select_provider(
        &self,
        strategy: SelectionStrategy,
        tried: &std::collections::HashSet<usize>,
    ) -> Option<usize> {
        let mut available = Vec::with_capacity(self.entries.len());
        for (idx, entry) in self.entries.iter().enumerate() {
            if tried.contains(&idx) {
                continue;
            }
            let runtime = entry.runtime.lock().await;
            if self.is_available(&runtime).await {
                available.push((
                    idx,
                    AvailableProvider {
                        id: entry.spec.id.clone(),
                        priority: entry.spec.priority,
                        success_rate: runtime.success_rate(),
                        speed_factor: runtime.speed_factor(),
                        avg_response_time_secs: runtime.avg_response_time_secs,
                    },
                ));
            }
        }

        if available.is_empty() {
            return None;
        }

        let snapshot: Vec<AvailableProvider> = available.iter().map(|(_, a)| a.clone()).collect();
        let round_robin_index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
        let mut rng = self.rng.lock().await;
        let chosen = strategy::select(strategy, &snapshot, round_robin_index, &mut *rng)?;
        available
            .into_iter()
            .find(|(_, a)| a.id == chosen.id)
            .map(|(idx, _)| idx)
    }

    /// spec §3 availability predicate, with one deliberate correction: the
    /// half-open clock runs off the last *attempt* rather than the last
    /// *success*, so a provider that has never once succeeded still
    /// recovers once `circuit_breaker_half_open_seconds` has elapsed
    /// (spec.md Scenario S6) instead of tripping permanently.
    async fn is_available(&self, runtime: &ProviderRuntime) -> bool {
        if let Some(until) = runtime.rate_limit_until {
            if Utc::now() < until {
                return false;
            }
        }

        if runtime.consecutive_failures >= self.config.circuit_breaker_failure_threshold {
            match runtime.last_used {
                Some(last) => {
                    let elapsed = Utc::now().signed_duration_since(last).num_seconds();
                    elapsed > self.config.circuit_breaker_half_open_seconds
                }
                None => true,
            }
        } else {
            true
        }
    }

    pub async fn stats(&self) -> ProviderStats {
        self.stats.lock().await.clone()
    }

    pub async fn reset_stats(&self) {
        *self.stats.lock().await = ProviderStats::default();
        for entry in &self.entries {
            *entry.runtime.lock().await = ProviderRuntime::default();
        }
    }

    /// Per-provider snapshot for operator-facing health checks (spec §6).
    pub async fn health(&self) -> Vec<ProviderHealthEntry> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let runtime = entry.runtime.lock().await;
            out.push(ProviderHealthEntry {
                id: entry.spec.id.clone(),
                name: entry.spec.name.clone(),
                priority: entry.spec.priority,
                status: runtime.status,
                success_count: runtime.success_count,
                failure_count: runtime.failure_count,
                consecutive_failures: runtime.consecutive_failures,
                avg_response_time_secs: runtime.avg_response_time_secs,
                last_error: runtime.last_error.clone(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    use crate::provider::transport::TransportResult;

    fn spec(id: &str, priority: i32) -> ProviderSpec {
        ProviderSpec {
            id: id.to_string(),
            name: id.to_string(),
            kind: "mock".to_string(),
            base_url: "http://localhost".to_string(),
            model: "mock-model".to_string(),
            priority,
            timeout_seconds: 30,
            max_tokens: 1024,
            temperature: 0.7,
        }
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            prompt: "hello".to_string(),
            system_prompt: None,
            options: Default::default(),
        }
    }

    /// Scripted transport: fails for every id in `fail_ids`, succeeds for
    /// everything else, and never actually sleeps.
    struct ScriptedTransport {
        fail_ids: Vec<String>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderTransport for ScriptedTransport {
        async fn send(
            &self,
            provider: &ProviderSpec,
            _request: &GenerateRequest,
            _timeout: Duration,
        ) -> TransportResult {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_ids.contains(&provider.id) {
                TransportResult::failure(Duration::from_millis(10), "boom")
            } else {
                TransportResult::success(Duration::from_millis(10), "ok", Some(5))
            }
        }
    }

    /// Fails the first `fail_counts[id]` calls to a given provider id, then
    /// succeeds for that id from then on.
    struct FlakyIdTransport {
        fail_counts: std::collections::HashMap<String, u32>,
        remaining: Mutex<std::collections::HashMap<String, u32>>,
    }

    impl FlakyIdTransport {
        fn new(fail_counts: std::collections::HashMap<String, u32>) -> Self {
            let remaining = Mutex::new(fail_counts.clone());
            Self { fail_counts, remaining }
        }
    }

    #[async_trait]
    impl ProviderTransport for FlakyIdTransport {
        async fn send(
            &self,
            provider: &ProviderSpec,
            _request: &GenerateRequest,
            _timeout: Duration,
        ) -> TransportResult {
            if !self.fail_counts.contains_key(&provider.id) {
                return TransportResult::success(Duration::from_millis(10), "ok", Some(5));
            }
            let mut remaining = self.remaining.lock().await;
            let left = remaining.entry(provider.id.clone()).or_insert(0);
            if *left > 0 {
                *left -= 1;
                TransportResult::failure(Duration::from_millis(10), "boom")
            } else {
                TransportResult::success(Duration::from_millis(10), "ok", Some(5))
            }
        }
    }

    /// Always-failing transport, used for circuit-breaker scenarios.
    struct AlwaysFails;

    #[async_trait]
    impl ProviderTransport for AlwaysFails {
        async fn send(
            &self,
            _provider: &ProviderSpec,
            _request: &GenerateRequest,
            _timeout: Duration,
        ) -> TransportResult {
            TransportResult::failure(Duration::from_millis(5), "down")
        }
    }

    fn manager_config() -> ProviderManagerConfig {
        ProviderManagerConfig {
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_half_open_seconds: 600,
            rate_limit_cooldown_seconds: 300,
            default_max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn priority_strategy_tries_lowest_priority_first() {
        let transport = Arc::new(ScriptedTransport {
            fail_ids: vec![],
            calls: AtomicU32::new(0),
        });
        let manager = ProviderFallbackManager::new(
            vec![spec("b", 2), spec("a", 1)],
            transport,
            manager_config(),
        );

        let response = manager
            .generate(request(), SelectionStrategy::Priority, None)
            .await;
        assert!(response.success);
        assert_eq!(response.provider_id.as_deref(), Some("a"));
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn falls_back_to_next_provider_on_failure() {
        let transport = Arc::new(ScriptedTransport {
            fail_ids: vec!["a".to_string()],
            calls: AtomicU32::new(0),
        });
        let manager = ProviderFallbackManager::new(
            vec![spec("a", 1), spec("b", 2)],
            transport,
            manager_config(),
        );

        let response = manager
            .generate(request(), SelectionStrategy::Priority, None)
            .await;
        assert!(response.success);
        assert_eq!(response.provider_id.as_deref(), Some("b"));
        assert_eq!(response.attempts, 2);

        let stats = manager.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.total_fallbacks, 1);
        assert_eq!(stats.failed_requests, 0);
    }

    #[tokio::test]
    async fn three_calls_with_one_bad_provider_yields_two_fallbacks() {
        // P1 fails twice then succeeds; P2 always succeeds.
        let transport = Arc::new(FlakyIdTransport::new(std::collections::HashMap::from([(
            "a".to_string(),
            2,
        )])));
        let manager = ProviderFallbackManager::new(
            vec![spec("a", 1), spec("b", 2)],
            transport,
            manager_config(),
        );

        for _ in 0..3 {
            let response = manager
                .generate(request(), SelectionStrategy::Priority, Some(3))
                .await;
            assert!(response.success);
        }

        let stats = manager.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 3);
        assert_eq!(stats.failed_requests, 0);
        assert_eq!(stats.total_fallbacks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_breaker_trips_then_half_opens_after_cooldown() {
        let transport = Arc::new(AlwaysFails);
        let config = ProviderManagerConfig {
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_half_open_seconds: 600,
            rate_limit_cooldown_seconds: 300,
            default_max_attempts: 1,
        };
        let manager = ProviderFallbackManager::new(vec![spec("solo", 1)], transport, config);

        for _ in 0..5 {
            let response = manager
                .generate(request(), SelectionStrategy::Priority, None)
                .await;
            assert!(!response.success);
        }

        let tripped = manager
            .generate(request(), SelectionStrategy::Priority, None)
            .await;
        assert!(!tripped.success);
        assert_eq!(tripped.attempts, 0);
        assert_eq!(tripped.error.as_deref(), Some("All providers failed"));

        tokio::time::advance(Duration::from_secs(601)).await;

        let recovered = manager
            .generate(request(), SelectionStrategy::Priority, None)
            .await;
        assert_eq!(recovered.attempts, 1);
    }

    #[tokio::test]
    async fn round_robin_cycles_across_calls() {
        let transport = Arc::new(ScriptedTransport {
            fail_ids: vec![],
            calls: AtomicU32::new(0),
        });
        let manager = ProviderFallbackManager::new(
            vec![spec("a", 1), spec("b", 2)],
            transport,
            manager_config(),
        );

        let first = manager
            .generate(request(), SelectionStrategy::RoundRobin, Some(1))
            .await;
        let second = manager
            .generate(request(), SelectionStrategy::RoundRobin, Some(1))
            .await;
        assert_ne!(first.provider_id, second.provider_id);
    }

    #[tokio::test]
    async fn reset_stats_clears_counters_and_circuit_state() {
        let transport = Arc::new(AlwaysFails);
        let manager = ProviderFallbackManager::new(vec![spec("solo", 1)], transport, manager_config());

        manager
            .generate(request(), SelectionStrategy::Priority, None)
            .await;
        manager.reset_stats().await;

        let stats = manager.stats().await;
        assert_eq!(stats.total_requests, 0);
        let health = manager.health().await;
        assert_eq!(health[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn health_reports_per_provider_snapshot() {
        let transport = Arc::new(ScriptedTransport {
            fail_ids: vec![],
            calls: AtomicU32::new(0),
        });
        let manager = ProviderFallbackManager::new(vec![spec("a", 1)], transport, manager_config());
        manager
            .generate(request(), SelectionStrategy::Priority, None)
            .await;

        let health = manager.health().await;
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].success_count, 1);
        assert_eq!(health[0].status, ProviderStatus::Active);
    }

    #[tokio::test]
    async fn intelligent_strategy_is_deterministic_with_seeded_manager() {
        let transport = Arc::new(ScriptedTransport {
            fail_ids: vec![],
            calls: AtomicU32::new(0),
        });
        let manager = ProviderFallbackManager::new(
            vec![spec("a", 1), spec("b", 2)],
            transport,
            manager_config(),
        )
        .with_seeded_rng(42);

        let response = manager
            .generate(request(), SelectionStrategy::Intelligent, None)
            .await;
        assert!(response.success);
    }
}
