use super::{ProviderError, SourcingProvider};
use crate::http::build_client;
use crate::models::SourcingOffer;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::{env, time::Duration};

const ENDPOINT: &str = "https://shopping.yahooapis.jp/ShoppingWebService/V3/itemSearch";
const MAX_RESULTS: usize = 50;

/// Yahoo! Shopping item search (V3), cheapest first.
pub struct YahooProvider {
    client: Client,
    app_id: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(default)]
    name: String,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    url: String,
}

impl YahooProvider {
    pub fn from_env() -> Option<Self> {
        let app_id = env::var("YAHOO_APP_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        Some(Self {
            client: build_client(),
            app_id,
        })
    }
}

fn parse(body: &str) -> Result<Vec<SourcingOffer>, ProviderError> {
    let payload: SearchResponse =
        serde_json::from_str(body).map_err(|err| ProviderError::Malformed(err.to_string()))?;
    Ok(payload
        .hits
        .into_iter()
        .map(|hit| SourcingOffer {
            provider_id: "yahoo".into(),
            unit_price: hit.price,
            shipping_cost: 0.0,
            source_url: hit.url,
            title: hit.name,
        })
        .collect())
}

#[async_trait]
impl SourcingProvider for YahooProvider {
    fn id(&self) -> &str {
        "yahoo"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_millis(1000)
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SourcingOffer>, ProviderError> {
        let results = limit.clamp(1, MAX_RESULTS).to_string();
        let response = self
            .client
            .get(ENDPOINT)
            .query(&[
                ("appid", self.app_id.as_str()),
                ("query", query),
                ("results", results.as_str()),
                ("sort", "+price"),
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
    fn parses_hits() {
        let body = r#"{"totalResultsAvailable": 1, "hits": [
            {"name": "Makita drill", "price": 12800, "url": "https://store.shopping.yahoo.co.jp/s/1.html",
             "shipping": {"code": 2, "name": "free"}}
        ]}"#;
        let offers = parse(body).expect("parse");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].provider_id, "yahoo");
        assert_eq!(offers[0].unit_price, 12800.0);
    }

    #[test]
    fn empty_payload_means_no_offers() {
        assert!(parse("{}").expect("parse").is_empty());
    }
}
