//! HTTP dispatch of a single endpoint.
//!
//! The dispatcher is side-effect free with respect to persistent state and
//! never returns an error: every failure mode folds into an [`Outcome`]
//! variant that the governor and run records consume.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use crate::common::crypto::{open_headers, HeaderCipher};
use crate::domains::jobs::models::{HttpMethod, JobEndpoint, RunStatus};

/// Response capture cap applied when the endpoint does not configure one.
pub const DEFAULT_MAX_RESPONSE_KB: i64 = 256;

const USER_AGENT: &str = concat!("cadence-scheduler/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to fire one HTTP call, captured from a consistent
/// endpoint snapshot. Sealed header values are opened at construction so the
/// dispatcher itself never touches the cipher.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub endpoint_id: Uuid,
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout_ms: i64,
    pub max_response_size_kb: i64,
}

impl DispatchRequest {
    pub fn from_endpoint(endpoint: &JobEndpoint, cipher: Option<&HeaderCipher>) -> Result<Self> {
        let headers = open_headers(cipher, &endpoint.headers_json.0)
            .context("failed to open endpoint headers")?;
        Ok(Self {
            endpoint_id: endpoint.id,
            url: endpoint.url.clone(),
            method: endpoint.method,
            headers,
            body: endpoint.body_json.clone(),
            timeout_ms: endpoint.effective_timeout_ms(),
            max_response_size_kb: endpoint
                .max_response_size_kb
                .unwrap_or(DEFAULT_MAX_RESPONSE_KB),
        })
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        status_code: u16,
        duration_ms: i64,
        body: Option<Value>,
    },
    HttpFailure {
        status_code: u16,
        duration_ms: i64,
        body: Option<Value>,
    },
    Timeout {
        duration_ms: i64,
    },
    NetworkFailure {
        error: String,
        duration_ms: i64,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn run_status(&self) -> RunStatus {
        match self {
            Outcome::Success { .. } => RunStatus::Success,
            Outcome::HttpFailure { .. } | Outcome::NetworkFailure { .. } => RunStatus::Failed,
            Outcome::Timeout { .. } => RunStatus::Timeout,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            Outcome::Success { duration_ms, .. }
            | Outcome::HttpFailure { duration_ms, .. }
            | Outcome::Timeout { duration_ms }
            | Outcome::NetworkFailure { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn status_code(&self) -> Option<i32> {
        match self {
            Outcome::Success { status_code, .. } | Outcome::HttpFailure { status_code, .. } => {
                Some(*status_code as i32)
            }
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Outcome::Timeout { duration_ms } => {
                Some(format!("dispatch timed out after {duration_ms}ms"))
            }
            Outcome::NetworkFailure { error, .. } => Some(error.clone()),
            Outcome::HttpFailure { status_code, .. } => {
                Some(format!("endpoint returned HTTP {status_code}"))
            }
            Outcome::Success { .. } => None,
        }
    }

    pub fn response_body(&self) -> Option<&Value> {
        match self {
            Outcome::Success { body, .. } | Outcome::HttpFailure { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

/// Seam between the scheduler and the network.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Outcome;
}

/// Production dispatcher over a shared reqwest client.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn send(&self, request: &DispatchRequest) -> Result<Outcome, String> {
        let url = Url::parse(&request.url).map_err(|e| format!("invalid url: {e}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("refusing non-http(s) url scheme {:?}", url.scheme()));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name {name:?}"))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| format!("invalid header value for {name:?}"))?;
            headers.insert(name, value);
        }

        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status();

        let cap_bytes = (request.max_response_size_kb.max(1) as usize) * 1024;
        let (bytes, truncated) = read_capped(response, cap_bytes)
            .await
            .map_err(|e| e.to_string())?;

        let duration_ms = started.elapsed().as_millis() as i64;
        let body = shape_body(&bytes, truncated);

        if status.is_success() {
            Ok(Outcome::Success {
                status_code: status.as_u16(),
                duration_ms,
                body,
            })
        } else {
            Ok(Outcome::HttpFailure {
                status_code: status.as_u16(),
                duration_ms,
                body,
            })
        }
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Outcome {
        let timeout = Duration::from_millis(request.timeout_ms.max(1) as u64);
        let started = Instant::now();

        match tokio::time::timeout(timeout, self.send(&request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => Outcome::NetworkFailure {
                error,
                duration_ms: started.elapsed().as_millis() as i64,
            },
            Err(_) => Outcome::Timeout {
                duration_ms: request.timeout_ms,
            },
        }
    }
}

/// Read at most `cap` bytes of the response body, noting whether more existed.
async fn read_capped(
    mut response: reqwest::Response,
    cap: usize,
) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut collected = Vec::new();
    let mut truncated = false;

    while let Some(chunk) = response.chunk().await? {
        let room = cap.saturating_sub(collected.len());
        if chunk.len() > room {
            collected.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        collected.extend_from_slice(&chunk);
    }

    Ok((collected, truncated))
}

/// Shape captured bytes into the stored `response_body` value.
///
/// Valid JSON is stored as-is; anything else as a string. Truncation is
/// recorded inside the value so consumers can tell a partial capture apart.
fn shape_body(bytes: &[u8], truncated: bool) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    if truncated {
        return Some(json!({ "truncated": true, "body": text }));
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(text.into_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> DispatchRequest {
        DispatchRequest {
            endpoint_id: Uuid::new_v4(),
            url: url.to_string(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            body: None,
            timeout_ms: 1_000,
            max_response_size_kb: 64,
        }
    }

    #[tokio::test]
    async fn refuses_non_http_schemes() {
        let dispatcher = HttpDispatcher::new().unwrap();
        let outcome = dispatcher.dispatch(request("ftp://example.com/file")).await;

        match outcome {
            Outcome::NetworkFailure { error, .. } => assert!(error.contains("non-http")),
            other => panic!("expected NetworkFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refuses_unparseable_urls() {
        let dispatcher = HttpDispatcher::new().unwrap();
        let outcome = dispatcher.dispatch(request("not a url")).await;

        assert!(matches!(outcome, Outcome::NetworkFailure { .. }));
    }

    #[test]
    fn shape_body_keeps_json() {
        let body = shape_body(br#"{"ok": true}"#, false).unwrap();
        assert_eq!(body["ok"], true);
    }

    #[test]
    fn shape_body_wraps_truncated_payloads() {
        let body = shape_body(br#"{"ok": tr"#, true).unwrap();
        assert_eq!(body["truncated"], true);
        assert!(body["body"].as_str().unwrap().starts_with("{\"ok\""));
    }

    #[test]
    fn shape_body_stores_plain_text_as_string() {
        let body = shape_body(b"pong", false).unwrap();
        assert_eq!(body, Value::String("pong".to_string()));
    }

    #[test]
    fn empty_body_is_none() {
        assert!(shape_body(b"", false).is_none());
    }

    #[test]
    fn outcome_maps_to_run_status() {
        let success = Outcome::Success {
            status_code: 200,
            duration_ms: 5,
            body: None,
        };
        let failure = Outcome::HttpFailure {
            status_code: 503,
            duration_ms: 5,
            body: None,
        };
        let timeout = Outcome::Timeout { duration_ms: 1_000 };

        assert_eq!(success.run_status(), RunStatus::Success);
        assert_eq!(failure.run_status(), RunStatus::Failed);
        assert_eq!(timeout.run_status(), RunStatus::Timeout);
    }

    #[test]
    fn outcome_error_messages() {
        let timeout = Outcome::Timeout { duration_ms: 750 };
        assert_eq!(
            timeout.error_message().unwrap(),
            "dispatch timed out after 750ms"
        );

        let failure = Outcome::HttpFailure {
            status_code: 404,
            duration_ms: 5,
            body: None,
        };
        assert_eq!(failure.error_message().unwrap(), "endpoint returned HTTP 404");

        let ok = Outcome::Success {
            status_code: 204,
            duration_ms: 5,
            body: None,
        };
        assert!(ok.error_message().is_none());
    }
}
