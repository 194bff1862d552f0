pub mod auth;
pub mod browse;
pub mod config;
pub mod demo;

pub use browse::BrowseLookup;
pub use demo::DemoLookup;

use crate::models::ItemSnapshot;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LookupError {
    #[error("cannot extract an item id from '{0}'")]
    InvalidReference(String),
    #[error("item {0} not found (sold or removed)")]
    NotFound(String),
    #[error("marketplace auth failed: {0}")]
    Auth(String),
    #[error("marketplace transport error: {0}")]
    Transport(String),
    #[error("malformed item payload: {0}")]
    Malformed(String),
}

/// Fetches canonical listing data for an item reference (URL or id).
#[async_trait]
pub trait ItemLookup: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, item_reference: &str) -> Result<ItemSnapshot, LookupError>;
}

/// Short links carry no id; they must be resolved by following redirects.
pub fn is_short_link(reference: &str) -> bool {
    let reference = reference.trim();
    let without_scheme = reference
        .strip_prefix("https://")
        .or_else(|| reference.strip_prefix("http://"))
        .unwrap_or(reference);
    let host = without_scheme.split('/').next().unwrap_or_default();
    host.ends_with("ebay.us") || host.ends_with("ebay.to")
}

/// Accepts `/itm/<id>`, `/itm/<slug>/<id>`, `?item=<id>`, `v1|<id>|0` and bare
/// numeric ids.
pub fn extract_item_id(reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    if let Some(rest) = reference.strip_prefix("v1|") {
        let id = rest.split('|').next().unwrap_or_default();
        return all_digits(id).then(|| id.to_string());
    }
    if all_digits(reference) {
        return Some(reference.to_string());
    }

    let (path, query) = match reference.split_once('?') {
        Some((path, query)) => (path, query.split('#').next().unwrap_or_default()),
        None => (reference.split('#').next().unwrap_or_default(), ""),
    };

    if let Some((_, after)) = path.split_once("/itm/") {
        let mut segments = after.split('/');
        let first = segments.next().unwrap_or_default();
        let second = segments.next().unwrap_or_default();
        for candidate in [second, first] {
            let digits = leading_digits(candidate);
            if !digits.is_empty() {
                return Some(digits.to_string());
            }
        }
    }

    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "item")
        .map(|(_, value)| value)
        .filter(|value| all_digits(value))
        .map(str::to_string)
}

fn all_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

fn leading_digits(value: &str) -> &str {
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_item_ids() {
        let cases = [
            ("https://www.ebay.com/itm/256789012345", Some("256789012345")),
            (
                "https://www.ebay.com/itm/bandai-mg-rx-78-2/256789012345?hash=item3b",
                Some("256789012345"),
            ),
            ("https://www.ebay.com/itm/256789012345/", Some("256789012345")),
            (
                "https://cgi.ebay.com/ws/eBayISAPI.dll?ViewItem&item=1234567890",
                Some("1234567890"),
            ),
            ("v1|1234567890|0", Some("1234567890")),
            ("  1234567890 ", Some("1234567890")),
            ("https://www.ebay.com/sch/i.html?_nkw=gundam", None),
            ("https://www.ebay.com/itm/no-id-here", None),
            ("", None),
        ];
        for (input, expected) in cases {
            assert_eq!(extract_item_id(input).as_deref(), expected, "{input}");
        }
    }

    #[test]
    fn recognises_short_links() {
        assert!(is_short_link("https://ebay.us/m/xZnI6h"));
        assert!(is_short_link("ebay.to/3abc"));
        assert!(!is_short_link("https://www.ebay.com/itm/1"));
    }
}
