use super::{ProviderError, SourcingProvider};
use crate::http::build_client;
use crate::models::SourcingOffer;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::{env, time::Duration};

const ENDPOINT: &str = "https://app.rakuten.co.jp/services/api/IchibaItem/Search/20170706";
// The API caps `hits` at 30.
const MAX_HITS: usize = 30;

/// Rakuten Ichiba item search.
pub struct RakutenProvider {
    client: Client,
    application_id: String,
    affiliate_id: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default, rename = "Items")]
    items: Vec<Item>,
}

#[derive(Deserialize)]
struct Item {
    #[serde(default, rename = "itemName")]
    name: String,
    #[serde(default, rename = "itemPrice")]
    price: f64,
    #[serde(default, rename = "itemUrl")]
    url: String,
}

impl RakutenProvider {
    pub fn from_env() -> Option<Self> {
        let application_id = env::var("RAKUTEN_APPLICATION_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        Some(Self {
            client: build_client(),
            application_id,
            affiliate_id: env::var("RAKUTEN_AFFILIATE_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }
}

fn parse(body: &str) -> Result<Vec<SourcingOffer>, ProviderError> {
    let payload: SearchResponse =
        serde_json::from_str(body).map_err(|err| ProviderError::Malformed(err.to_string()))?;
    Ok(payload
        .items
        .into_iter()
        .map(|item| SourcingOffer {
            provider_id: "rakuten".into(),
            unit_price: item.price,
            // item prices are tax and postage inclusive for most shops
            shipping_cost: 0.0,
            source_url: item.url,
            title: item.name,
        })
        .collect())
}

#[async_trait]
impl SourcingProvider for RakutenProvider {
    fn id(&self) -> &str {
        "rakuten"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_millis(1000)
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SourcingOffer>, ProviderError> {
        let hits = limit.clamp(1, MAX_HITS).to_string();
        let mut params = vec![
            ("applicationId", self.application_id.as_str()),
            ("keyword", query),
            ("hits", hits.as_str()),
            ("sort", "+itemPrice"),
            ("format", "json"),
            ("formatVersion", "2"),
        ];
        if let Some(affiliate) = &self.affiliate_id {
            params.push(("affiliateId", affiliate.as_str()));
        }
        let response = self
            .client
            .get(ENDPOINT)
            .query(&params)
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
    fn parses_flat_item_format() {
        let body = r#"{"count": 2, "Items": [
            {"itemName": "MG RX-78-2", "itemPrice": 4980, "itemUrl": "https://item.rakuten.co.jp/shop/a/"},
            {"itemName": "no url", "itemPrice": 100}
        ]}"#;
        let offers = parse(body).expect("parse");
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].unit_price, 4980.0);
        assert_eq!(offers[0].provider_id, "rakuten");
        assert!(offers[1].source_url.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse("<html>"), Err(ProviderError::Malformed(_))));
    }
}
