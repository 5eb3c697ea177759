//! Inference gateway: the contract the dispatcher depends on, plus the
//! OpenRouter implementation.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;

pub use error::{ErrorContext, GatewayErrorKind, ProviderError};
pub use openrouter::OpenRouterAdapter;
pub use pricing::{is_free_listing, parse_pricing, ModelPricing};
pub use types::*;

/// Sends one prompt to one backend.
///
/// The dispatcher only ever talks to this trait; transport, auth headers and
/// response decoding are the implementor's business.
#[async_trait::async_trait]
pub trait GenerationClient: Send + Sync {
    async fn send(
        &self,
        backend_id: &str,
        payload: &PromptPayload,
        options: &SendOptions,
    ) -> Result<String, ProviderError>;
}

/// Lists the backends currently offered by the gateway.
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_backends(&self) -> Result<Vec<ModelListing>, ProviderError>;
}
