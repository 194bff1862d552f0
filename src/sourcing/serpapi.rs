use super::{ProviderError, SourcingProvider};
use crate::http::build_client;
use crate::models::SourcingOffer;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::env;

const ENDPOINT: &str = "https://serpapi.com/search";

/// Google Shopping results through SerpApi, restricted to the Japanese market.
/// One call covers many storefronts; the domestic filter does the rest.
pub struct SerpApiProvider {
    client: Client,
    api_key: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    shopping_results: Vec<ShoppingResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ShoppingResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    product_link: Option<String>,
    #[serde(default)]
    extracted_price: Option<Value>,
    #[serde(default)]
    price: Option<String>,
}

impl SerpApiProvider {
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("SERPAPI_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        Some(Self {
            client: build_client(),
            api_key,
        })
    }
}

/// `extracted_price` is usually numeric; older payloads only carry a display
/// string such as `¥1,234` or `1,234円`.
fn price_of(result: &ShoppingResult) -> Option<f64> {
    let from_display = |raw: &str| {
        raw.chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect::<String>()
            .parse::<f64>()
            .ok()
    };
    match &result.extracted_price {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => from_display(s),
        _ => result.price.as_deref().and_then(from_display),
    }
}

fn parse(body: &str) -> Result<Vec<SourcingOffer>, ProviderError> {
    let payload: SearchResponse =
        serde_json::from_str(body).map_err(|err| ProviderError::Malformed(err.to_string()))?;
    if let Some(error) = payload.error
        && payload.shopping_results.is_empty()
    {
        // "Google hasn't returned any results" is an empty result, not a failure
        if error.to_lowercase().contains("returned any results") {
            return Ok(Vec::new());
        }
        return Err(ProviderError::Malformed(error));
    }
    Ok(payload
        .shopping_results
        .iter()
        .filter_map(|result| {
            let url = result.link.clone().or_else(|| result.product_link.clone())?;
            Some(SourcingOffer {
                provider_id: "serpapi".into(),
                unit_price: price_of(result)?,
                shipping_cost: 0.0,
                source_url: url,
                title: result.title.clone(),
            })
        })
        .collect())
}

#[async_trait]
impl SourcingProvider for SerpApiProvider {
    fn id(&self) -> &str {
        "serpapi"
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SourcingOffer>, ProviderError> {
        // fetch more than needed: many results are filtered as non-domestic
        let num = (limit.max(1) * 4).min(40).to_string();
        let response = self
            .client
            .get(ENDPOINT)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("engine", "google_shopping"),
                ("q", query),
                ("location", "Japan"),
                ("hl", "ja"),
                ("gl", "jp"),
                ("num", num.as_str()),
            ])
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::from_status(response.status()));
        }
        let body = response
            .text()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_display_prices() {
        let body = r#"{"shopping_results": [
            {"title": "A", "link": "https://www.yodobashi.com/product/1/", "extracted_price": 4280},
            {"title": "B", "product_link": "https://www.biccamera.com/bc/item/2/", "price": "¥5,980"},
            {"title": "C", "extracted_price": 100}
        ]}"#;
        let offers = parse(body).expect("parse");
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].unit_price, 4280.0);
        assert_eq!(offers[1].unit_price, 5980.0);
        assert_eq!(offers[1].provider_id, "serpapi");
    }

    #[test]
    fn no_results_error_is_empty() {
        let body = r#"{"error": "Google hasn't returned any results for this query."}"#;
        assert!(parse(body).expect("parse").is_empty());
        let body = r#"{"error": "Invalid API key."}"#;
        assert!(parse(body).is_err());
    }
}
