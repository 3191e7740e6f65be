//! Provider Fallback Manager (spec §4.3, component E).

mod manager;
mod strategy;
mod transport;
mod types;

pub use manager::ProviderFallbackManager;
pub use strategy::AvailableProvider;
pub use transport::{ProviderTransport, TransportResult};
pub use types::{
    GenerateRequest, GenerateResponse, ProviderHealthEntry, ProviderRuntime, ProviderSpec,
    ProviderStats, ProviderStatus, SelectionStrategy,
};
