use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Trigger payload posted by the dispatch collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriggerInput {
    pub item_reference: String,
    pub row_key: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// One unit of work: a single item lookup that ends in a profit verdict for
/// one row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchRequest {
    pub request_id: Uuid,
    pub item_reference: String,
    pub row_key: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ResearchRequest {
    pub fn new(item_reference: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            item_reference: item_reference.into(),
            row_key: row_key.into(),
            submitted_at: Utc::now(),
            correlation_id: None,
        }
    }
}

impl From<TriggerInput> for ResearchRequest {
    fn from(input: TriggerInput) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            item_reference: input.item_reference.trim().to_string(),
            row_key: input.row_key.trim().to_string(),
            submitted_at: input.submitted_at.unwrap_or_else(Utc::now),
            correlation_id: input
                .correlation_id
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }
}

/// Canonical listing data fetched from the marketplace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemSnapshot {
    pub item_id: String,
    pub title: String,
    pub listing_price: f64,
    pub listing_shipping_cost: f64,
    pub currency: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub weight_g: Option<u32>,
}

impl ItemSnapshot {
    /// Price the buyer pays, listing shipping included.
    pub fn sell_total(&self) -> f64 {
        self.listing_price + self.listing_shipping_cost
    }
}

/// A priced quote from one sourcing provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourcingOffer {
    pub provider_id: String,
    pub unit_price: f64,
    pub shipping_cost: f64,
    pub source_url: String,
    #[serde(default)]
    pub title: String,
}

impl SourcingOffer {
    pub fn landed_cost(&self) -> f64 {
        self.unit_price + self.shipping_cost
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfitSource {
    Surface,
    Fallback,
}

impl ProfitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfitSource::Surface => "surface",
            ProfitSource::Fallback => "fallback",
        }
    }
}

/// Profit figures in whole units of the local currency and integer percent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfitResult {
    pub profit_amount: i64,
    pub profit_margin_pct: i32,
    pub profit_amount_with_rebate: i64,
    pub profit_margin_pct_with_rebate: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_method: Option<String>,
    pub source: ProfitSource,
}

impl ProfitResult {
    pub fn is_profitable(&self) -> bool {
        self.profit_amount >= 1
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
