use crate::models::{ItemSnapshot, ProfitResult, SourcingOffer};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;
pub const ROW_COLUMNS: usize = 20;

pub const ROW_HEADERS: [&str; ROW_COLUMNS] = [
    "date",
    "item_link",
    "keyword",
    "category",
    "category_id",
    "offer_1_url",
    "offer_1_price",
    "offer_2_url",
    "offer_2_price",
    "offer_3_url",
    "offer_3_price",
    "sell_link",
    "sell_price",
    "sell_shipping",
    "profit",
    "margin_pct",
    "profit_with_rebate",
    "margin_pct_with_rebate",
    "status",
    "memo",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Profit(ProfitResult),
    /// No provider returned a usable offer. Distinct from a computed zero profit.
    NoSourcingFound,
}

/// Payload of a `done` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub schema_version: u32,
    pub item_reference: String,
    pub item: ItemSnapshot,
    pub search_query: String,
    /// Cheapest first, at most three.
    pub offers: Vec<SourcingOffer>,
    pub verdict: Verdict,
}

impl ResultRecord {
    pub fn new(
        item_reference: impl Into<String>,
        item: ItemSnapshot,
        search_query: impl Into<String>,
        mut offers: Vec<SourcingOffer>,
        verdict: Verdict,
    ) -> Self {
        offers.truncate(3);
        Self {
            schema_version: SCHEMA_VERSION,
            item_reference: item_reference.into(),
            item,
            search_query: search_query.into(),
            offers,
            verdict,
        }
    }

    pub fn profit(&self) -> Option<&ProfitResult> {
        match &self.verdict {
            Verdict::Profit(result) => Some(result),
            Verdict::NoSourcingFound => None,
        }
    }

    /// Fixed v1 row layout consumed by the spreadsheet side.
    pub fn to_row(&self, date: NaiveDate, status: &str, memo: &str) -> Vec<String> {
        let mut row = vec![String::new(); ROW_COLUMNS];
        row[0] = date.format("%Y-%m-%d").to_string();
        row[1] = self.item_reference.clone();
        row[2] = self.search_query.clone();
        row[3] = self.item.category.clone().unwrap_or_default();
        row[4] = self.item.category_id.clone().unwrap_or_default();
        for (idx, offer) in self.offers.iter().take(3).enumerate() {
            row[5 + idx * 2] = offer.source_url.clone();
            row[6 + idx * 2] = format_amount(offer.landed_cost());
        }
        row[11] = self.item_reference.clone();
        row[12] = format_amount(self.item.listing_price);
        row[13] = format_amount(self.item.listing_shipping_cost);
        if let Some(profit) = self.profit() {
            row[14] = profit.profit_amount.to_string();
            row[15] = profit.profit_margin_pct.to_string();
            row[16] = profit.profit_amount_with_rebate.to_string();
            row[17] = profit.profit_margin_pct_with_rebate.to_string();
        }
        row[18] = status.to_string();
        row[19] = memo.to_string();
        row
    }
}

fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProfitSource;

    fn item() -> ItemSnapshot {
        ItemSnapshot {
            item_id: "1234567890".into(),
            title: "Bandai MG RX-78-2 Gundam 1/100".into(),
            listing_price: 49.99,
            listing_shipping_cost: 0.0,
            currency: "USD".into(),
            category: Some("Model Kits".into()),
            category_id: Some("2586".into()),
            weight_g: None,
        }
    }

    fn offer(n: u32) -> SourcingOffer {
        SourcingOffer {
            provider_id: "rakuten".into(),
            unit_price: 3000.0 + f64::from(n),
            shipping_cost: 0.0,
            source_url: format!("https://item.rakuten.co.jp/shop/{n}"),
            title: String::new(),
        }
    }

    #[test]
    fn row_has_twenty_columns_in_order() {
        let record = ResultRecord::new(
            "https://www.ebay.com/itm/1234567890",
            item(),
            "RX-78-2 1/100 Bandai",
            vec![offer(1), offer(2), offer(3), offer(4)],
            Verdict::Profit(ProfitResult {
                profit_amount: 755,
                profit_margin_pct: 10,
                profit_amount_with_rebate: 1210,
                profit_margin_pct_with_rebate: 16,
                carrier: None,
                shipping_method: None,
                source: ProfitSource::Fallback,
            }),
        );
        assert_eq!(record.offers.len(), 3);
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).expect("date");
        let row = record.to_row(date, "done", "ok");
        assert_eq!(row.len(), ROW_COLUMNS);
        assert_eq!(row[0], "2025-03-01");
        assert_eq!(row[5], "https://item.rakuten.co.jp/shop/1");
        assert_eq!(row[6], "3001");
        assert_eq!(row[12], "49.99");
        assert_eq!(row[14], "755");
        assert_eq!(row[17], "16");
        assert_eq!(row[18], "done");
    }

    #[test]
    fn no_sourcing_leaves_profit_columns_blank() {
        let record = ResultRecord::new("ref", item(), "q", vec![], Verdict::NoSourcingFound);
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).expect("date");
        let row = record.to_row(date, "done", "no sourcing found");
        assert!(row[5].is_empty());
        assert!(row[14..18].iter().all(String::is_empty));
        let json = serde_json::to_value(&record).expect("json");
        assert_eq!(json["verdict"]["kind"], "no_sourcing_found");
    }
}
