use super::{ItemLookup, LookupError, extract_item_id};
use crate::models::ItemSnapshot;
use async_trait::async_trait;

/// Offline lookup: any reference with a recognisable item id resolves to the
/// same listing. `not_found` ids simulate a removed item.
#[derive(Clone, Default)]
pub struct DemoLookup {
    snapshot: Option<ItemSnapshot>,
    not_found: Vec<String>,
}

impl DemoLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: ItemSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            not_found: Vec::new(),
        }
    }

    pub fn missing(mut self, item_id: impl Into<String>) -> Self {
        self.not_found.push(item_id.into());
        self
    }

    pub fn sample_snapshot(item_id: &str) -> ItemSnapshot {
        ItemSnapshot {
            item_id: item_id.to_string(),
            title: "Bandai MG 1/100 RX-78-2 Gundam Ver.3.0 Model Kit [Japan Import]".to_string(),
            listing_price: 49.99,
            listing_shipping_cost: 15.0,
            currency: "USD".to_string(),
            category: Some("Toys & Hobbies > Models & Kits".to_string()),
            category_id: Some("1188".to_string()),
            weight_g: Some(700),
        }
    }
}

#[async_trait]
impl ItemLookup for DemoLookup {
    fn name(&self) -> &'static str {
        "demo"
    }

    async fn fetch(&self, item_reference: &str) -> Result<ItemSnapshot, LookupError> {
        let item_id = extract_item_id(item_reference)
            .ok_or_else(|| LookupError::InvalidReference(item_reference.to_string()))?;
        if self.not_found.contains(&item_id) {
            return Err(LookupError::NotFound(item_id));
        }
        Ok(match &self.snapshot {
            Some(snapshot) => ItemSnapshot {
                item_id,
                ..snapshot.clone()
            },
            None => Self::sample_snapshot(&item_id),
        })
    }
}
