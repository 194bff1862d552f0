pub mod estimate;
pub mod fallback;
pub mod surface;

pub use estimate::{PackageEstimate, estimate_package};
pub use fallback::ProfitError;
pub use surface::SurfaceStrategy;

use crate::config::FeeConfig;
use crate::models::{ProfitResult, ProfitSource};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Everything a strategy may need to price one selected offer.
#[derive(Debug, Clone, Serialize)]
pub struct ProfitInputs {
    /// Landed cost of the selected offer, local currency.
    pub source_price: f64,
    /// Listing price, marketplace currency.
    pub sell_price: f64,
    /// Shipping the buyer pays on the listing, marketplace currency.
    pub listing_shipping: f64,
    pub weight_g: Option<u32>,
    pub dimensions_cm: Option<[f64; 3]>,
    pub item_url: Option<String>,
    pub category_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StrategyOutcome {
    Valid(ProfitResult),
    Invalid { reason: String },
}

#[async_trait]
pub trait ProfitStrategy: Send + Sync {
    fn source(&self) -> ProfitSource;

    async fn compute(&self, inputs: &ProfitInputs) -> StrategyOutcome;
}

/// Local formula: sell price includes the listing shipping, outbound shipping
/// comes from configuration.
pub struct FallbackStrategy {
    fees: FeeConfig,
}

impl FallbackStrategy {
    pub fn new(fees: FeeConfig) -> Self {
        Self { fees }
    }
}

#[async_trait]
impl ProfitStrategy for FallbackStrategy {
    fn source(&self) -> ProfitSource {
        ProfitSource::Fallback
    }

    async fn compute(&self, inputs: &ProfitInputs) -> StrategyOutcome {
        match fallback::compute(
            inputs.source_price,
            inputs.sell_price + inputs.listing_shipping,
            self.fees.outbound_shipping,
            &self.fees,
        ) {
            Ok(result) => StrategyOutcome::Valid(result),
            Err(err) => StrategyOutcome::Invalid {
                reason: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyAttempt {
    pub source: ProfitSource,
    #[serde(flatten)]
    pub outcome: StrategyOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub result: Option<ProfitResult>,
    pub attempts: Vec<StrategyAttempt>,
}

/// Tries strategies in order and stops at the first valid result.
pub async fn resolve(strategies: &[Arc<dyn ProfitStrategy>], inputs: &ProfitInputs) -> Resolution {
    let mut attempts = Vec::with_capacity(strategies.len());
    for strategy in strategies {
        let outcome = strategy.compute(inputs).await;
        let source = strategy.source();
        let result = match &outcome {
            StrategyOutcome::Valid(result) => Some(result.clone()),
            StrategyOutcome::Invalid { reason } => {
                info!(
                    target = "research.pipeline",
                    strategy = source.as_str(),
                    reason = %reason,
                    "profit strategy produced no usable result"
                );
                None
            }
        };
        attempts.push(StrategyAttempt { source, outcome });
        if result.is_some() {
            return Resolution { result, attempts };
        }
    }
    Resolution {
        result: None,
        attempts,
    }
}
