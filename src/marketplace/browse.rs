use super::auth::TokenCache;
use super::config::{BROWSE_ITEM_URL, MARKETPLACE_ID, has_credentials};
use super::{ItemLookup, LookupError, extract_item_id, is_short_link};
use crate::http::build_client;
use crate::models::ItemSnapshot;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use tracing::{debug, info};

/// eBay Browse API `getItem`, authenticated with an application token.
pub struct BrowseLookup {
    client: Client,
    tokens: TokenCache,
}

#[serde_as]
#[derive(Deserialize)]
struct Amount {
    #[serde_as(as = "DisplayFromStr")]
    value: f64,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Deserialize)]
struct ShippingOption {
    #[serde(default, rename = "shippingCost")]
    shipping_cost: Option<Amount>,
}

#[derive(Deserialize)]
struct Aspect {
    name: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowseItem {
    #[serde(default)]
    legacy_item_id: Option<String>,
    title: String,
    price: Amount,
    #[serde(default)]
    category_path: Option<String>,
    #[serde(default)]
    category_id: Option<String>,
    #[serde(default)]
    shipping_options: Vec<ShippingOption>,
    #[serde(default)]
    localized_aspects: Vec<Aspect>,
}

impl BrowseLookup {
    pub fn new() -> Self {
        Self {
            client: build_client(),
            tokens: TokenCache::new(),
        }
    }

    /// `None` when no marketplace credentials are configured.
    pub fn from_env() -> Option<Self> {
        has_credentials().then(Self::new)
    }

    async fn resolve_reference(&self, reference: &str) -> Result<String, LookupError> {
        if !is_short_link(reference) {
            return Ok(reference.trim().to_string());
        }
        let url = if reference.contains("://") {
            reference.trim().to_string()
        } else {
            format!("https://{}", reference.trim())
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| LookupError::Transport(format!("resolving {url}: {err}")))?;
        let resolved = response.url().to_string();
        debug!(target = "research.marketplace", short = %url, resolved = %resolved, "resolved short link");
        Ok(resolved)
    }

    async fn get_item(&self, item_id: &str) -> Result<String, LookupError> {
        let url = format!(
            "{}/{}",
            *BROWSE_ITEM_URL,
            urlencoding::encode(&format!("v1|{item_id}|0"))
        );
        for attempt in 0..2 {
            let token = self.tokens.token(&self.client).await?;
            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .header("X-EBAY-C-MARKETPLACE-ID", MARKETPLACE_ID.as_str())
                .send()
                .await
                .map_err(|err| LookupError::Transport(err.to_string()))?;
            match response.status() {
                StatusCode::UNAUTHORIZED if attempt == 0 => {
                    self.tokens.invalidate().await;
                    continue;
                }
                StatusCode::NOT_FOUND => return Err(LookupError::NotFound(item_id.to_string())),
                status if !status.is_success() => {
                    return Err(LookupError::Transport(format!("HTTP {status}")));
                }
                _ => {}
            }
            return response
                .text()
                .await
                .map_err(|err| LookupError::Transport(err.to_string()));
        }
        Err(LookupError::Auth("token rejected twice".into()))
    }
}

impl Default for BrowseLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ItemLookup for BrowseLookup {
    fn name(&self) -> &'static str {
        "ebay-browse"
    }

    async fn fetch(&self, item_reference: &str) -> Result<ItemSnapshot, LookupError> {
        let resolved = self.resolve_reference(item_reference).await?;
        let item_id = extract_item_id(&resolved)
            .ok_or_else(|| LookupError::InvalidReference(item_reference.to_string()))?;
        let body = self.get_item(&item_id).await?;
        let snapshot = parse_item(&body, &item_id)?;
        info!(
            target = "research.marketplace",
            item_id = %snapshot.item_id,
            price = snapshot.listing_price,
            currency = %snapshot.currency,
            "fetched item"
        );
        Ok(snapshot)
    }
}

fn parse_item(body: &str, item_id: &str) -> Result<ItemSnapshot, LookupError> {
    let item: BrowseItem =
        serde_json::from_str(body).map_err(|err| LookupError::Malformed(err.to_string()))?;
    let shipping = item
        .shipping_options
        .iter()
        .find_map(|option| option.shipping_cost.as_ref())
        .map(|amount| amount.value)
        .unwrap_or(0.0);
    let weight_g = item
        .localized_aspects
        .iter()
        .filter(|aspect| aspect.name.to_lowercase().contains("weight"))
        .find_map(|aspect| parse_weight_grams(&aspect.value));
    Ok(ItemSnapshot {
        item_id: item.legacy_item_id.unwrap_or_else(|| item_id.to_string()),
        title: item.title,
        listing_price: item.price.value,
        listing_shipping_cost: shipping,
        currency: item.price.currency.unwrap_or_else(|| "USD".to_string()),
        category: item.category_path.map(|path| path.replace('|', " > ")),
        category_id: item.category_id,
        weight_g,
    })
}

/// Reads free-text weights such as `700 g`, `1.2kg`, `2 lbs` or `8 oz`.
fn parse_weight_grams(raw: &str) -> Option<u32> {
    let raw = raw.trim().to_lowercase();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let amount: f64 = raw[..split].parse().ok()?;
    let unit = raw[split..].trim();
    let grams = match unit {
        "g" | "gram" | "grams" => amount,
        "kg" | "kgs" | "kilogram" | "kilograms" => amount * 1000.0,
        "lb" | "lbs" | "pound" | "pounds" => amount * 453.592,
        "oz" | "ounce" | "ounces" => amount * 28.3495,
        _ => return None,
    };
    (grams > 0.0).then(|| grams.round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browse_item() {
        let body = r#"{
            "itemId": "v1|256789012345|0",
            "legacyItemId": "256789012345",
            "title": "Bandai MG 1/100 RX-78-2 Gundam Ver.3.0 [Japan Import]",
            "price": {"value": "49.99", "currency": "USD"},
            "categoryPath": "Toys & Hobbies|Models & Kits",
            "categoryId": "1188",
            "shippingOptions": [{"shippingCost": {"value": "15.00", "currency": "USD"}}],
            "localizedAspects": [{"type": "STRING", "name": "Item Weight", "value": "700 g"}]
        }"#;
        let snapshot = parse_item(body, "256789012345").expect("parse");
        assert_eq!(snapshot.listing_price, 49.99);
        assert_eq!(snapshot.listing_shipping_cost, 15.0);
        assert_eq!(snapshot.category.as_deref(), Some("Toys & Hobbies > Models & Kits"));
        assert_eq!(snapshot.weight_g, Some(700));
    }

    #[test]
    fn missing_shipping_is_free() {
        let body = r#"{"title": "x", "price": {"value": "10.00"}}"#;
        let snapshot = parse_item(body, "1").expect("parse");
        assert_eq!(snapshot.item_id, "1");
        assert_eq!(snapshot.listing_shipping_cost, 0.0);
        assert_eq!(snapshot.currency, "USD");
    }

    #[test]
    fn non_numeric_price_is_malformed() {
        let body = r#"{"title": "x", "price": {"value": "call"}}"#;
        assert!(matches!(
            parse_item(body, "1"),
            Err(LookupError::Malformed(_))
        ));
    }

    #[test]
    fn weight_units() {
        assert_eq!(parse_weight_grams("1.2 kg"), Some(1200));
        assert_eq!(parse_weight_grams("8 oz"), Some(227));
        assert_eq!(parse_weight_grams("2lbs"), Some(907));
        assert_eq!(parse_weight_grams("heavy"), None);
    }
}
