//! Provider adapters
//!
//! One concrete `BookProvider` per external source, each paired with a pure
//! normalizer from the provider's raw payload to `PartialBook`.

pub mod catalog;
pub mod http;
pub mod publisher;
pub mod ratings;
pub mod storefront;

use crate::config::ProvidersConfig;
use crate::types::{LookupIntent, PartialBook, ProviderError, ProviderId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use catalog::CatalogProvider;
pub use publisher::PublisherProvider;
pub use ratings::RatingsProvider;
pub use storefront::StorefrontProvider;

/// Capability every metadata source implements
///
/// An empty `Ok` result and `Err(NotFound)` both mean "nothing here"; neither
/// counts against the provider's circuit breaker.
#[async_trait]
pub trait BookProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Per-request budget this adapter expects
    fn timeout(&self) -> Duration;

    /// Whether this adapter can answer the intent at all
    ///
    /// Identifier lookups are only sent to the owning namespace by default.
    fn supports(&self, intent: &LookupIntent) -> bool {
        match intent {
            LookupIntent::Search(_) => true,
            LookupIntent::Identifier { id } => id.provider == self.id(),
        }
    }

    async fn fetch(
        &self,
        intent: &LookupIntent,
        timeout: Duration,
    ) -> Result<Vec<PartialBook>, ProviderError>;
}

/// Instantiate every enabled provider
pub fn build_providers(config: &ProvidersConfig) -> libris_common::Result<Vec<Arc<dyn BookProvider>>> {
    let mut providers: Vec<Arc<dyn BookProvider>> = Vec::new();

    for id in ProviderId::ALL {
        let pc = config.get(id);
        if !pc.enabled {
            tracing::info!(provider = %id, "Provider disabled by configuration");
            continue;
        }

        let provider: Arc<dyn BookProvider> = match id {
            ProviderId::Catalog => Arc::new(CatalogProvider::new(pc)?),
            ProviderId::Storefront => Arc::new(StorefrontProvider::new(pc)?),
            ProviderId::Ratings => Arc::new(RatingsProvider::new(pc)?),
            ProviderId::Publisher => Arc::new(PublisherProvider::new(pc)?),
        };
        tracing::info!(provider = %id, base_url = %pc.base_url, "Provider enabled");
        providers.push(provider);
    }

    Ok(providers)
}
