//! Listing price parsing.
//!
//! The listing endpoint publishes prices as decimal strings in USD per token.
//! Only one question is asked of them: is the model free.

use super::types::{ListingPricing, ModelListing};

/// Parsed per-token pricing for a listed model, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModelPricing {
    pub prompt_usd: f64,
    pub completion_usd: f64,
    /// Flat cost per request.
    pub request_usd: f64,
    pub image_usd: f64,
}

impl ModelPricing {
    /// Exact zero on every component; a tiny price is still a price.
    pub fn is_zero_cost(&self) -> bool {
        [self.prompt_usd, self.completion_usd, self.request_usd, self.image_usd]
            .iter()
            .all(|p| *p == 0.0)
    }
}

/// Parse a USD price string.
///
/// Negative prices (OpenRouter uses "-1" for "variable") and garbage parse to
/// `None` so that they can never be mistaken for free.
pub fn parse_usd(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value)
}

/// Parse listing pricing. Prompt and completion prices are mandatory.
pub fn parse_pricing(pricing: &ListingPricing) -> Option<ModelPricing> {
    let prompt = parse_usd(pricing.prompt.as_deref()?)?;
    let completion = parse_usd(pricing.completion.as_deref()?)?;
    let optional = |raw: &Option<String>| match raw.as_deref() {
        None => Some(0.0),
        Some(s) => parse_usd(s),
    };
    Some(ModelPricing {
        prompt_usd: prompt,
        completion_usd: completion,
        request_usd: optional(&pricing.request)?,
        image_usd: optional(&pricing.image)?,
    })
}

/// Whether a listed model is on the free tier.
pub fn is_free_listing(listing: &ModelListing) -> bool {
    parse_pricing(&listing.pricing)
        .map(|p| p.is_zero_cost())
        .unwrap_or(false)
}
