use super::LookupError;
use super::config::{APP_ID, APP_SECRET, BROWSE_SCOPE, OAUTH_TOKEN_URL, has_credentials};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

// Refresh a little before the advertised expiry.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    7200
}

fn basic_auth_header() -> Result<String, LookupError> {
    if !has_credentials() {
        return Err(LookupError::Auth("missing EBAY_APP_ID / EBAY_CERT_ID".into()));
    }
    Ok(format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", *APP_ID, *APP_SECRET))
    ))
}

/// Application token (client-credentials grant), cached until shortly before
/// it expires.
#[derive(Default)]
pub struct TokenCache {
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn token(&self, client: &Client) -> Result<String, LookupError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, valid_until)) = cached.as_ref()
            && Instant::now() < *valid_until
        {
            return Ok(token.clone());
        }
        let response = request_token(client).await?;
        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(EXPIRY_SLACK);
        debug!(
            target = "research.marketplace",
            expires_in = response.expires_in,
            "fetched application token"
        );
        *cached = Some((response.access_token.clone(), Instant::now() + lifetime));
        Ok(response.access_token)
    }

    /// Forget the cached token, e.g. after a 401.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

async fn request_token(client: &Client) -> Result<TokenResponse, LookupError> {
    let authorization = basic_auth_header()?;
    let params = [("grant_type", "client_credentials"), ("scope", BROWSE_SCOPE)];
    let response = client
        .post(OAUTH_TOKEN_URL.as_str())
        .header(reqwest::header::AUTHORIZATION, authorization)
        .form(&params)
        .send()
        .await
        .map_err(|err| LookupError::Auth(err.to_string()))?;

    if !response.status().is_success() {
        return Err(LookupError::Auth(format!("HTTP {}", response.status())));
    }

    response
        .json()
        .await
        .map_err(|err| LookupError::Auth(err.to_string()))
}
