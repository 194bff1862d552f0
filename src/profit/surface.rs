use super::{ProfitInputs, ProfitStrategy, StrategyOutcome};
use crate::models::ProfitSource;
use crate::surface::{SurfaceInputs, SurfacePool, Validity};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Prices the offer on the shared calculation surface. The lease covers
/// write, propagation and read, and the row is cleared on every path.
pub struct SurfaceStrategy {
    pool: SurfacePool,
    lock_wait: Duration,
    max_wait: Duration,
}

impl SurfaceStrategy {
    pub fn new(pool: SurfacePool, lock_wait: Duration, max_wait: Duration) -> Self {
        Self {
            pool,
            lock_wait,
            max_wait,
        }
    }
}

#[async_trait]
impl ProfitStrategy for SurfaceStrategy {
    fn source(&self) -> ProfitSource {
        ProfitSource::Surface
    }

    async fn compute(&self, inputs: &ProfitInputs) -> StrategyOutcome {
        let lease = match self.pool.acquire(self.lock_wait).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(target = "research.surface", error = %err, "surface lease not obtained");
                crate::metrics::surface_outcome("contention");
                return StrategyOutcome::Invalid {
                    reason: err.to_string(),
                };
            }
        };

        let surface_inputs = SurfaceInputs {
            weight_g: inputs.weight_g,
            dimensions_cm: inputs.dimensions_cm,
            item_url: inputs.item_url.clone(),
            category_id: inputs.category_id.clone(),
            ..SurfaceInputs::new(
                inputs.source_price,
                inputs.sell_price,
                inputs.listing_shipping,
            )
        };

        let outcome = match lease.bridge().write_inputs(&surface_inputs).await {
            Err(err) => StrategyOutcome::Invalid {
                reason: format!("writing inputs failed: {err}"),
            },
            Ok(()) => match lease.bridge().read_outputs(self.max_wait).await {
                Err(err) => StrategyOutcome::Invalid {
                    reason: format!("reading outputs failed: {err}"),
                },
                Ok(reading) => match (reading.validity, reading.outputs.to_profit_result()) {
                    (Validity::Valid, Some(result)) => StrategyOutcome::Valid(result),
                    (Validity::Invalid { reason }, _) => StrategyOutcome::Invalid { reason },
                    (Validity::Valid, None) => StrategyOutcome::Invalid {
                        reason: "outputs unreadable".into(),
                    },
                },
            },
        };
        lease.release().await;
        crate::metrics::surface_outcome(match outcome {
            StrategyOutcome::Valid(_) => "valid",
            StrategyOutcome::Invalid { .. } => "invalid",
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use crate::surface::{CalculationBridge, SimulatedSurface, SurfaceLayout};
    use std::sync::Arc;

    fn strategy(propagation: Duration, max_wait: Duration) -> (SurfaceStrategy, SurfacePool) {
        let surface = Arc::new(SimulatedSurface::new(FeeConfig::default(), propagation));
        let bridge = CalculationBridge::new(
            surface,
            SurfaceLayout::at_row("search_base", 10).expect("layout"),
            Duration::from_millis(10),
        );
        let pool = SurfacePool::new(vec![bridge], None).expect("pool");
        (
            SurfaceStrategy::new(pool.clone(), Duration::from_millis(30), max_wait),
            pool,
        )
    }

    fn inputs() -> ProfitInputs {
        ProfitInputs {
            source_price: 5000.0,
            sell_price: 50.0,
            listing_shipping: 0.0,
            weight_g: Some(1500),
            dimensions_cm: None,
            item_url: Some("https://www.ebay.com/itm/1".into()),
            category_id: Some("261068".into()),
        }
    }

    #[tokio::test]
    async fn settled_surface_gives_a_surface_result() {
        let (strategy, pool) = strategy(Duration::from_millis(5), Duration::from_millis(500));
        match strategy.compute(&inputs()).await {
            StrategyOutcome::Valid(result) => {
                assert_eq!(result.source, ProfitSource::Surface);
                assert_eq!(result.shipping_method.as_deref(), Some("EMS"));
            }
            other => panic!("expected valid outcome, got {other:?}"),
        }
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn slow_propagation_is_invalid_not_fatal() {
        let (strategy, pool) = strategy(Duration::from_secs(5), Duration::from_millis(40));
        let outcome = strategy.compute(&inputs()).await;
        assert!(matches!(outcome, StrategyOutcome::Invalid { .. }));
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn held_lease_turns_into_contention() {
        let (strategy, pool) = strategy(Duration::from_millis(5), Duration::from_millis(500));
        let _held = pool.acquire(Duration::from_millis(10)).await.expect("lease");
        match strategy.compute(&inputs()).await {
            StrategyOutcome::Invalid { reason } => assert!(reason.contains("no scratch row")),
            other => panic!("expected contention, got {other:?}"),
        }
    }
}
