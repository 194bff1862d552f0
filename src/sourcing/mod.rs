pub mod demo;
pub mod domestic;
pub mod query;
pub mod rakuten;
pub mod serpapi;
pub mod similarity;
pub mod yahoo;

pub use demo::StaticProvider;
pub use query::derive_query;
pub use rakuten::RakutenProvider;
pub use serpapi::SerpApiProvider;
pub use similarity::title_similarity;
pub use yahoo::YahooProvider;

use crate::config::SourcingSettings;
use crate::models::SourcingOffer;
use async_trait::async_trait;
use futures::{FutureExt, future::join_all};
use serde::Serialize;
use std::{cmp::Ordering, panic::AssertUnwindSafe, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{Duration, Instant, sleep_until, timeout},
};
use tracing::{info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

impl ProviderError {
    /// Maps an HTTP status to the matching failure class.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited(format!("HTTP {status}"))
        } else {
            ProviderError::Transport(format!("HTTP {status}"))
        }
    }
}

/// One independent sourcing backend.
#[async_trait]
pub trait SourcingProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Documented minimum spacing between two calls.
    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    async fn search(&self, query: &str, limit: usize)
    -> Result<Vec<SourcingOffer>, ProviderError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchConstraints {
    pub domestic_only: bool,
    pub max_unit_price: Option<f64>,
    pub min_title_similarity: f64,
    pub max_results_per_provider: usize,
}

impl From<&SourcingSettings> for SearchConstraints {
    fn from(settings: &SourcingSettings) -> Self {
        Self {
            domestic_only: settings.domestic_only,
            max_unit_price: settings.max_unit_price,
            min_title_similarity: settings.min_title_similarity,
            max_results_per_provider: settings.max_results_per_provider.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderReport {
    pub provider_id: String,
    pub offers: Vec<SourcingOffer>,
    pub returned: usize,
    pub dropped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcingReport {
    pub query: String,
    pub providers: Vec<ProviderReport>,
    /// All kept offers, cheapest landed cost first.
    pub ranked: Vec<SourcingOffer>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourcingOutcome {
    Found {
        selected: SourcingOffer,
        report: SourcingReport,
    },
    NoOfferFound {
        report: SourcingReport,
    },
}

impl SourcingOutcome {
    pub fn report(&self) -> &SourcingReport {
        match self {
            SourcingOutcome::Found { report, .. } | SourcingOutcome::NoOfferFound { report } => {
                report
            }
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn SourcingProvider>,
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl ProviderSlot {
    /// Sleeps until the provider's interval has passed since the previous
    /// call started. Other providers are never blocked by this gate.
    async fn wait_turn(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}

pub struct SourcingAggregator {
    slots: Vec<ProviderSlot>,
    provider_timeout: Duration,
}

impl SourcingAggregator {
    /// Provider order is priority order for tie-breaks.
    pub fn new(providers: Vec<Arc<dyn SourcingProvider>>, settings: &SourcingSettings) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| ProviderSlot {
                interval: settings.min_interval_for(provider.id(), provider.min_interval()),
                provider,
                last_call: Mutex::new(None),
            })
            .collect();
        Self {
            slots,
            provider_timeout: settings.provider_timeout,
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| slot.provider.id().to_string())
            .collect()
    }

    pub async fn search(&self, query: &str, constraints: &SearchConstraints) -> SourcingOutcome {
        let calls = self
            .slots
            .iter()
            .map(|slot| self.query_provider(slot, query, constraints));
        let providers = join_all(calls).await;
        let ranked = rank(&providers);
        let report = SourcingReport {
            query: query.to_string(),
            providers,
            ranked,
        };
        match select_best(&report.providers) {
            Some(selected) => {
                info!(
                    target = "research.sourcing",
                    provider = %selected.provider_id,
                    landed_cost = selected.landed_cost(),
                    candidates = report.ranked.len(),
                    "selected cheapest offer"
                );
                SourcingOutcome::Found { selected, report }
            }
            None => {
                info!(
                    target = "research.sourcing",
                    query,
                    "no provider returned a usable offer"
                );
                SourcingOutcome::NoOfferFound { report }
            }
        }
    }

    async fn query_provider(
        &self,
        slot: &ProviderSlot,
        query: &str,
        constraints: &SearchConstraints,
    ) -> ProviderReport {
        let provider_id = slot.provider.id().to_string();
        slot.wait_turn().await;
        let started = Instant::now();
        let call = AssertUnwindSafe(
            slot.provider
                .search(query, constraints.max_results_per_provider),
        )
        .catch_unwind();
        let result = match timeout(self.provider_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProviderError::Transport("provider panicked".into())),
            Err(_) => Err(ProviderError::Timeout {
                after_ms: self.provider_timeout.as_millis() as u64,
            }),
        };
        let elapsed_ms = started.elapsed().as_millis();
        match result {
            Ok(offers) => {
                let returned = offers.len();
                let kept = normalise(offers, query, constraints);
                crate::metrics::provider_call(&provider_id, "ok", elapsed_ms);
                ProviderReport {
                    provider_id,
                    dropped: returned - kept.len(),
                    returned,
                    offers: kept,
                    error: None,
                    elapsed_ms: elapsed_ms as u64,
                }
            }
            Err(err) => {
                warn!(
                    target = "research.sourcing",
                    provider = %provider_id,
                    error = %err,
                    "provider failed; continuing without it"
                );
                crate::metrics::provider_call(&provider_id, "error", elapsed_ms);
                ProviderReport {
                    provider_id,
                    offers: Vec::new(),
                    returned: 0,
                    dropped: 0,
                    error: Some(err.to_string()),
                    elapsed_ms: elapsed_ms as u64,
                }
            }
        }
    }
}

/// Drops unusable offers and keeps the cheapest `max_results_per_provider`,
/// preserving the provider's own order among equal landed costs.
///
/// Offers whose title cannot be compared with the query (empty, or no Latin
/// words at all) pass the similarity filter.
pub fn normalise(
    offers: Vec<SourcingOffer>,
    query: &str,
    constraints: &SearchConstraints,
) -> Vec<SourcingOffer> {
    let mut kept: Vec<SourcingOffer> = offers
        .into_iter()
        .filter(|offer| offer.unit_price.is_finite() && offer.unit_price > 0.0)
        .filter(|offer| offer.shipping_cost.is_finite() && offer.shipping_cost >= 0.0)
        .filter(|offer| !offer.source_url.trim().is_empty())
        .filter(|offer| !constraints.domestic_only || domestic::is_domestic_url(&offer.source_url))
        .filter(|offer| {
            constraints
                .max_unit_price
                .is_none_or(|max| offer.unit_price <= max)
        })
        .filter(|offer| {
            constraints.min_title_similarity <= 0.0
                || title_similarity(query, &offer.title)
                    .is_none_or(|score| score >= constraints.min_title_similarity)
        })
        .collect();
    kept.sort_by(by_landed_cost);
    kept.truncate(constraints.max_results_per_provider);
    kept
}

fn by_landed_cost(a: &SourcingOffer, b: &SourcingOffer) -> Ordering {
    a.landed_cost().total_cmp(&b.landed_cost())
}

/// Minimum landed cost; ties go to the earlier provider, then the earlier offer.
pub fn select_best(reports: &[ProviderReport]) -> Option<SourcingOffer> {
    let mut best: Option<&SourcingOffer> = None;
    for offer in reports.iter().flat_map(|report| report.offers.iter()) {
        if best.is_none_or(|current| offer.landed_cost() < current.landed_cost()) {
            best = Some(offer);
        }
    }
    best.cloned()
}

/// Every kept offer, cheapest first, stable with respect to provider priority.
pub fn rank(reports: &[ProviderReport]) -> Vec<SourcingOffer> {
    let mut all: Vec<SourcingOffer> = reports
        .iter()
        .flat_map(|report| report.offers.iter().cloned())
        .collect();
    all.sort_by(by_landed_cost);
    all
}
