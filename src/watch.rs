use crate::http::build_client;
use crate::rows::{RowRecord, RowStatus, RowStore};
use crate::security::API_KEY_HEADER;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{debug, info};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ATTEMPTS: u32 = 36;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("status request failed: {0}")]
    Transport(String),
    #[error("status endpoint rejected the API key")]
    Unauthorized,
    #[error("unreadable status payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    /// The row reached `done` or `error`.
    Finished(RowRecord),
    /// Attempts ran out while the row was still pending or processing. The
    /// run itself may still finish.
    SoftTimeout { last: Option<RowRecord> },
}

/// Where the watcher reads rows from.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(&self, row_key: &str) -> Result<Option<RowRecord>, WatchError>;
}

/// Reads `GET {base}/rows/{row_key}` on a running server.
pub struct HttpRowSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRowSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl RowSource for HttpRowSource {
    async fn fetch(&self, row_key: &str) -> Result<Option<RowRecord>, WatchError> {
        let url = format!("{}/rows/{}", self.base_url, urlencoding::encode(row_key));
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| WatchError::Transport(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED => Err(WatchError::Unauthorized),
            status if !status.is_success() => Err(WatchError::Transport(format!("HTTP {status}"))),
            _ => response
                .json::<RowRecord>()
                .await
                .map(Some)
                .map_err(|err| WatchError::Malformed(err.to_string())),
        }
    }
}

/// Reads straight from a row store, for in-process callers.
pub struct StoreRowSource(pub Arc<dyn RowStore>);

#[async_trait]
impl RowSource for StoreRowSource {
    async fn fetch(&self, row_key: &str) -> Result<Option<RowRecord>, WatchError> {
        self.0
            .load(row_key)
            .await
            .map_err(|err| WatchError::Transport(err.to_string()))
    }
}

/// Polls a row until it is terminal or `attempts` polls have been made.
/// Transport errors on a single poll are retried on the next one.
pub async fn watch(
    source: &dyn RowSource,
    row_key: &str,
    interval: Duration,
    attempts: u32,
) -> Result<WatchOutcome, WatchError> {
    let mut last = None;
    let mut last_log_len = 0;
    for attempt in 1..=attempts.max(1) {
        match source.fetch(row_key).await {
            Ok(Some(row)) => {
                for line in row.log.iter().skip(last_log_len) {
                    info!(target = "research.watch", row_key, "{line}");
                }
                last_log_len = row.log.len();
                if row.status.is_terminal() {
                    return Ok(WatchOutcome::Finished(row));
                }
                last = Some(row);
            }
            Ok(None) => debug!(target = "research.watch", row_key, attempt, "row not visible yet"),
            Err(WatchError::Unauthorized) => return Err(WatchError::Unauthorized),
            Err(err) => debug!(target = "research.watch", row_key, attempt, error = %err, "poll failed"),
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    info!(
        target = "research.watch",
        row_key,
        status = last
            .as_ref()
            .map(|row: &RowRecord| row.status)
            .unwrap_or(RowStatus::Pending)
            .as_str(),
        "stopped watching; the run may still finish"
    );
    Ok(WatchOutcome::SoftTimeout { last })
}
