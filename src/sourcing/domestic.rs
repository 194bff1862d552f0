//! Domestic-source URL filter. Offers from overseas storefronts, marketplaces
//! we sell on, documents and listing/search pages are never sourcing candidates.

const ALLOWED_DOMAINS: &[&str] = &[
    "amazon.co.jp",
    "rakuten.co.jp",
    "shopping.yahoo.co.jp",
    "yodobashi.com",
    "biccamera.com",
    "joshin.co.jp",
    "nojima.co.jp",
    "edion.com",
    "ksdenki.com",
    "yamada-denki",
    "kojima.net",
    "suruga-ya.jp",
    "amiami.jp",
    "hobby-wave",
    "goodsmile",
    "cardotaku",
    "komeri.com",
    "cainz.com",
    "kohnan-eshop",
    "dcm-ekurashi",
    "monotaro.com",
    "hikoki-powertools.jp",
    "makita-shop",
    "askul.co.jp",
    "lohaco.jp",
];

const DENIED_PATTERNS: &[&str] = &[
    ".pdf",
    "/pdf/",
    "amazon.com",
    "amazon.co.uk",
    "amazon.de",
    "amazon.fr",
    "amazon.it",
    "amazon.es",
    "amazon.nl",
    "amazon.ca",
    "ebay.com",
    "ebay.co.uk",
    "ebay.de",
    "walmart.com",
    "target.com",
    "bestbuy.com",
    "wish.com",
    "aliexpress",
    "alibaba",
    "shein.com",
    "temu.com",
    ".ch/",
    ".de/",
    ".nl/",
    ".fr/",
    ".it/",
    ".es/",
    ".co.uk/",
    ".com.au/",
    "search.rakuten.co.jp/search/",
    "search.yahoo.co.jp",
    "/search?",
    "/s?k=",
    "/item/?",
    "/products?",
    "/category/",
];

pub fn is_domestic_url(url: &str) -> bool {
    let url = url.trim().to_lowercase();
    if url.is_empty() || DENIED_PATTERNS.iter().any(|p| url.contains(p)) {
        return false;
    }
    if ALLOWED_DOMAINS.iter().any(|d| url.contains(d)) {
        return true;
    }
    // unknown shops on a Japanese domain
    url.contains(".co.jp") || url.contains(".jp/")
}
