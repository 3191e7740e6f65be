use thiserror::Error;

/// Top-level error type for `argus-core`.
///
/// Per spec.md §7, only *terminal* outcomes are ever surfaced through this
/// type. Retryable node failures, provider call failures, and anything else
/// the engine absorbs or retries internally never become an `ArgusError`.
#[derive(Debug, Error)]
pub enum ArgusError {
    /// A workflow definition failed registration validation (spec §3, §7).
    #[error("validation error: {0}")]
    Validation(String),

    /// An unknown workflow, execution, or node id was referenced.
    #[error("not found: {0}")]
    NotFound(String),

    /// A workflow-wide deadline elapsed.
    #[error("execution timeout: {0}")]
    ExecutionTimeout(String),

    /// The cleanup loop judged an execution stuck (RUNNING > 4h).
    #[error("execution stuck: {0}")]
    ExecutionStuck(String),

    /// Explicit cancellation or engine shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A task node failed terminally with no ERROR_HANDLER route.
    #[error("node failure: {0}")]
    NodeFailure(String),

    /// The provider fallback chain exhausted every attempt.
    #[error("all providers failed: {0}")]
    AllProvidersFailed(String),

    /// No provider passed the availability predicate at dispatch time.
    #[error("no active providers")]
    NoActiveProviders,

    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Wraps `std::io::Error` encountered while loading configuration or
    /// workflow definition files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArgusError>;
