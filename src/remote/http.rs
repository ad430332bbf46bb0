//! REST client for the remote document store.
//!
//! Wire format (all bodies JSON, authenticated with `X-Api-Key`):
//! - `POST   /v1/collections/{c}/documents`       -> `{ "id": "..." }`
//! - `PATCH  /v1/collections/{c}/documents/{id}`
//! - `DELETE /v1/collections/{c}/documents/{id}`
//! - `POST   /v1/collections/{c}:query`           -> `{ "documents": [...] }`
//! - `POST   /v1/batch`                           `{ "writes": [...] }`
//! - `GET    /v1/health`

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{Document, OrderBy, QueryFilter, RemoteError, RemoteStore, WriteOp};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the lightweight health probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Normalise the store base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/v1") {
        url.truncate(url.len() - 3);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Unavailable(format!("Cannot reach document store at {url}"));
    }
    if err.is_timeout() {
        return RemoteError::Unavailable(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return RemoteError::InvalidArgument(format!("Invalid document store URL: {url}"));
    }
    RemoteError::Unavailable(format!("Network error communicating with {url}: {err}"))
}

/// Map a non-success HTTP status (and the server's message) to an error code.
pub(crate) fn status_error(status: StatusCode, detail: String) -> RemoteError {
    match status.as_u16() {
        400 | 422 => RemoteError::InvalidArgument(detail),
        401 => RemoteError::Unauthenticated(detail),
        403 => RemoteError::PermissionDenied(detail),
        404 => RemoteError::NotFound(detail),
        409 => RemoteError::AlreadyExists(detail),
        429 => RemoteError::ResourceExhausted(detail),
        s if s >= 500 => RemoteError::Unavailable(detail),
        _ => RemoteError::Internal(detail),
    }
}

fn error_detail(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = json
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(Value::as_str)
            .or_else(|| json.get("message").and_then(Value::as_str))
        {
            return format!("{message} (HTTP {})", status.as_u16());
        }
    }
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {trimmed}", status.as_u16())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, api_key: Zeroizing<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn document_path(collection: &str, id: &str) -> String {
        format!(
            "/v1/collections/{}/documents/{}",
            percent_encode(collection),
            percent_encode(id)
        )
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, RemoteError> {
        let full_url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method.clone(), &full_url)
            .header("X-Api-Key", self.api_key.as_str());
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            debug!(%method, path, status = status.as_u16(), "Document store rejected request");
            return Err(status_error(status, error_detail(status, &body_text)));
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| RemoteError::Internal(format!("Invalid JSON from document store: {e}")))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create(
        &self,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<String, RemoteError> {
        let path = format!("/v1/collections/{}/documents", percent_encode(collection));
        let resp = self.send(Method::POST, &path, Some(Value::Object(data))).await?;
        resp.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Internal("Create response missing document id".into()))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: Map<String, Value>,
    ) -> Result<(), RemoteError> {
        let path = Self::document_path(collection, id);
        self.send(Method::PATCH, &path, Some(Value::Object(partial)))
            .await
            .map(|_| ())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let path = Self::document_path(collection, id);
        self.send(Method::DELETE, &path, None).await.map(|_| ())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[QueryFilter],
        order: Option<&OrderBy>,
    ) -> Result<Vec<Document>, RemoteError> {
        let path = format!("/v1/collections/{}:query", percent_encode(collection));
        let body = json!({ "filters": filters, "orderBy": order });
        let resp = self.send(Method::POST, &path, Some(body)).await?;
        let docs = resp
            .get("documents")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(docs
            .into_iter()
            .filter_map(|d| match d {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    async fn batch_commit(&self, writes: Vec<WriteOp>) -> Result<(), RemoteError> {
        let count = writes.len();
        self.send(Method::POST, "/v1/batch", Some(json!({ "writes": writes })))
            .await?;
        debug!(writes = count, "Batch committed");
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        let start = Instant::now();
        let resp = self
            .client
            .get(format!("{}/v1/health", self.base_url))
            .header("X-Api-Key", self.api_key.as_str())
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => {
                debug!(
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Document store reachable"
                );
                true
            }
            Ok(r) => {
                info!(status = r.status().as_u16(), "Document store health check failed");
                false
            }
            Err(_) => false,
        }
    }
}
