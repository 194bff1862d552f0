use super::{ProviderError, SourcingProvider};
use crate::models::SourcingOffer;
use async_trait::async_trait;

/// Fixed offer list. Backs demo runs and tests.
pub struct StaticProvider {
    id: String,
    offers: Vec<SourcingOffer>,
}

impl StaticProvider {
    pub fn new(id: impl Into<String>, offers: Vec<SourcingOffer>) -> Self {
        Self {
            id: id.into(),
            offers,
        }
    }

    /// Three domestic shops with distinct landed costs.
    pub fn demo_set() -> Vec<Self> {
        let offer = |provider: &str, unit_price: f64, shipping_cost: f64, url: &str| SourcingOffer {
            provider_id: provider.to_string(),
            unit_price,
            shipping_cost,
            source_url: url.to_string(),
            title: "BANDAI MG 1/100 RX-78-2 ガンダム Ver.3.0 プラモデル".to_string(),
        };
        vec![
            Self::new(
                "rakuten",
                vec![
                    offer("rakuten", 4980.0, 0.0, "https://item.rakuten.co.jp/demo-shop/item-1/"),
                    offer("rakuten", 5200.0, 0.0, "https://item.rakuten.co.jp/demo-shop/item-2/"),
                ],
            ),
            Self::new(
                "yahoo",
                vec![offer(
                    "yahoo",
                    4500.0,
                    700.0,
                    "https://store.shopping.yahoo.co.jp/demo-store/item-3.html",
                )],
            ),
            Self::new(
                "serpapi",
                vec![offer(
                    "serpapi",
                    5100.0,
                    0.0,
                    "https://www.yodobashi.com/product/100000001/",
                )],
            ),
        ]
    }
}

#[async_trait]
impl SourcingProvider for StaticProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn search(
        &self,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<SourcingOffer>, ProviderError> {
        Ok(self.offers.iter().take(limit.max(1)).cloned().collect())
    }
}
