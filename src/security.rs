//! Shared-key auth for the trigger and status endpoints. Each caller (the
//! sheet trigger, a CLI watcher, an ops script) is named and holds its own key,
//! so logs can say who started a run.

use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{env, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};

pub const API_KEY_HEADER: &str = "X-Research-Key";

const DEMO_KEYS: &str = "demo-client:demo-key";

#[derive(Debug, Error, PartialEq)]
pub enum KeyListError {
    #[error("entry {position} is not `caller:key`")]
    Malformed { position: usize },
    #[error("caller `{0}` is listed twice")]
    DuplicateCaller(String),
    #[error("entry {position} reuses another caller's key")]
    SharedKey { position: usize },
    #[error("no keys configured")]
    Empty,
}

/// Who made the request. Inserted as a request extension.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    pub name: String,
    /// Masked tail of the key, safe to log.
    pub key_hint: String,
}

#[derive(Debug)]
struct KeyEntry {
    caller: String,
    key: String,
}

/// Parsed `RESEARCH_API_KEYS`: `caller:key` pairs separated by commas.
#[derive(Debug, Clone)]
pub struct CallerKeys {
    entries: Arc<Vec<KeyEntry>>,
}

impl FromStr for CallerKeys {
    type Err = KeyListError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut entries: Vec<KeyEntry> = Vec::new();
        let tokens = raw
            .split(',')
            .map(str::trim)
            .enumerate()
            .filter(|(_, token)| !token.is_empty());
        for (idx, token) in tokens {
            let position = idx + 1;
            let (caller, key) = token
                .split_once(':')
                .map(|(caller, key)| (caller.trim(), key.trim()))
                .filter(|(caller, key)| !caller.is_empty() && !key.is_empty())
                .ok_or(KeyListError::Malformed { position })?;
            if entries.iter().any(|entry| entry.caller == caller) {
                return Err(KeyListError::DuplicateCaller(caller.to_string()));
            }
            if entries.iter().any(|entry| entry.key == key) {
                return Err(KeyListError::SharedKey { position });
            }
            entries.push(KeyEntry {
                caller: caller.to_string(),
                key: key.to_string(),
            });
        }
        if entries.is_empty() {
            return Err(KeyListError::Empty);
        }
        Ok(Self {
            entries: Arc::new(entries),
        })
    }
}

impl CallerKeys {
    /// Unset or blank falls back to the demo key; a malformed value is an error.
    pub fn from_env() -> Result<Self, KeyListError> {
        let keys = match env::var("RESEARCH_API_KEYS") {
            Ok(raw) if !raw.trim().is_empty() => raw.parse::<Self>()?,
            _ => {
                warn!(
                    target = "research.api",
                    "RESEARCH_API_KEYS is unset; accepting the demo key only"
                );
                DEMO_KEYS.parse::<Self>()?
            }
        };
        info!(
            target = "research.api",
            callers = keys.entries.len(),
            "loaded caller keys"
        );
        Ok(keys)
    }

    /// Every entry is compared, and each comparison runs over the whole key.
    pub fn identify(&self, presented: &str) -> Option<Caller> {
        let mut found = None;
        for entry in self.entries.iter() {
            if keys_match(entry.key.as_bytes(), presented.as_bytes()) && found.is_none() {
                found = Some(entry);
            }
        }
        found.map(|entry| Caller {
            name: entry.caller.clone(),
            key_hint: key_hint(&entry.key),
        })
    }
}

fn keys_match(expected: &[u8], presented: &[u8]) -> bool {
    expected.len() == presented.len()
        && expected
            .iter()
            .zip(presented)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

fn key_hint(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("***{tail}")
}

pub async fn authorize(
    State(keys): State<CallerKeys>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let caller = match presented_key(request.headers()) {
        Some(key) => keys.identify(key),
        None => {
            return rejection(
                "missing_api_key",
                "send `Authorization: Bearer <key>` or X-Research-Key",
            );
        }
    };
    match caller {
        Some(caller) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        None => rejection("invalid_api_key", "key not recognised"),
    }
}

/// A bearer token wins over the custom header when both are sent.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim());
    bearer
        .or_else(|| {
            headers
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        })
        .filter(|key| !key.is_empty())
}

fn rejection(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(payload),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, http::HeaderValue, middleware, routing::get};
    use tower::ServiceExt;

    #[test]
    fn bearer_and_header_keys_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer  sheet-secret "),
        );
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("ignored"));
        assert_eq!(presented_key(&headers), Some("sheet-secret"));

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(" cli-secret"));
        assert_eq!(presented_key(&headers), Some("cli-secret"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(presented_key(&headers), None);
        assert_eq!(presented_key(&HeaderMap::new()), None);
    }

    #[test]
    fn caller_keys_are_parsed_strictly() {
        let keys: CallerKeys = "sheet:s3cret-sheet-key, ,cli:other"
            .parse()
            .expect("valid keys");
        let sheet = keys.identify("s3cret-sheet-key").expect("known key");
        assert_eq!(sheet.name, "sheet");
        assert_eq!(sheet.key_hint, "***-key");
        assert_eq!(keys.identify("other").expect("known key").key_hint, "***");
        assert!(keys.identify("s3cret-sheet-kez").is_none());
        assert!(keys.identify("").is_none());

        assert_eq!(
            "sheet:a,broken".parse::<CallerKeys>().err(),
            Some(KeyListError::Malformed { position: 2 })
        );
        assert_eq!(
            "sheet:a,sheet:b".parse::<CallerKeys>().err(),
            Some(KeyListError::DuplicateCaller("sheet".into()))
        );
        assert_eq!(
            "sheet:a,cli:a".parse::<CallerKeys>().err(),
            Some(KeyListError::SharedKey { position: 2 })
        );
        assert_eq!(" , ".parse::<CallerKeys>().err(), Some(KeyListError::Empty));
    }

    #[tokio::test]
    async fn middleware_names_the_caller_or_rejects() {
        let keys: CallerKeys = "sheet:sheet-key".parse().expect("keys");
        let app = Router::new()
            .route(
                "/whoami",
                get(|Extension(caller): Extension<Caller>| async move { caller.name }),
            )
            .route_layer(middleware::from_fn_with_state(keys, authorize));

        let ok = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header(header::AUTHORIZATION, "bearer sheet-key")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(ok.status(), StatusCode::OK);
        let body = axum::body::to_bytes(ok.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"sheet");

        let denied = app
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header(API_KEY_HEADER, "wrong")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            denied.headers().get(header::WWW_AUTHENTICATE),
            Some(&HeaderValue::from_static("Bearer"))
        );
    }
}
