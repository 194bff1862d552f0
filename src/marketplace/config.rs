use once_cell::sync::Lazy;
use std::env;

pub static EBAY_ENV: Lazy<String> =
    Lazy::new(|| env::var("EBAY_ENV").unwrap_or_else(|_| "PROD".to_string()));

pub static APP_ID: Lazy<String> = Lazy::new(|| env::var("EBAY_APP_ID").unwrap_or_default());

pub static APP_SECRET: Lazy<String> = Lazy::new(|| env::var("EBAY_CERT_ID").unwrap_or_default());

pub static MARKETPLACE_ID: Lazy<String> =
    Lazy::new(|| env::var("EBAY_MARKETPLACE_ID").unwrap_or_else(|_| "EBAY_US".to_string()));

pub static ROOT: Lazy<String> = Lazy::new(|| {
    if EBAY_ENV.as_str().eq_ignore_ascii_case("SANDBOX") {
        "https://api.sandbox.ebay.com".to_string()
    } else {
        "https://api.ebay.com".to_string()
    }
});

pub static OAUTH_TOKEN_URL: Lazy<String> =
    Lazy::new(|| format!("{}/identity/v1/oauth2/token", *ROOT));

pub static BROWSE_ITEM_URL: Lazy<String> =
    Lazy::new(|| format!("{}/buy/browse/v1/item", *ROOT));

pub const BROWSE_SCOPE: &str = "https://api.ebay.com/oauth/api_scope";

pub fn has_credentials() -> bool {
    !APP_ID.is_empty() && !APP_SECRET.is_empty()
}
