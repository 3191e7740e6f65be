use async_trait::async_trait;
use std::time::Duration;

use super::types::{GenerateRequest, ProviderSpec};

/// Outcome of one attempt to send a request to one provider (spec §6,
/// consumed interface 6).
#[derive(Debug, Clone)]
pub struct TransportResult {
    pub ok: bool,
    pub elapsed: Duration,
    pub content: Option<String>,
    pub tokens_used: Option<u64>,
    pub err: Option<String>,
    /// Set when the transport can positively identify a rate-limit
    /// response. The manager only trusts this flag, never string-sniffing
    /// `err` (spec §6: "the contract is only that the manager can
    /// distinguish").
    pub rate_limited: bool,
}

impl TransportResult {
    pub fn success(elapsed: Duration, content: impl Into<String>, tokens_used: Option<u64>) -> Self {
        Self {
            ok: true,
            elapsed,
            content: Some(content.into()),
            tokens_used,
            err: None,
            rate_limited: false,
        }
    }

    pub fn failure(elapsed: Duration, err: impl Into<String>) -> Self {
        Self {
            ok: false,
            elapsed,
            content: None,
            tokens_used: None,
            err: Some(err.into()),
            rate_limited: false,
        }
    }

    pub fn rate_limited(elapsed: Duration, err: impl Into<String>) -> Self {
        Self {
            ok: false,
            elapsed,
            content: None,
            tokens_used: None,
            err: Some(err.into()),
            rate_limited: true,
        }
    }
}

/// One implementation per provider family (spec §6, interface 6).
///
/// The manager does not interpret anything beyond `ok`, `elapsed`,
/// `content`, `tokens_used`, `err`, and `rate_limited`.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(
        &self,
        provider: &ProviderSpec,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> TransportResult;
}
