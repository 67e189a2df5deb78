//! Remote admin API client.
//!
//! Authenticated HTTP push of pending sync records to the admin backend.
//! Also hosts the URL normalisation and connection-string helpers shared by
//! configuration and provisioning.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::repository::PendingRecord;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const BATCH_PATH: &str = "/api/pos/sync/batch";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

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
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key"])
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"])
        .map(|u| normalize_admin_url(&u))
        .filter(|s| !s.is_empty())
}

pub fn extract_tenant_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "tenantId", "tenant_id"])
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach admin API at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid admin API URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Device not authorized".to_string(),
        404 => "Sync endpoint not found".to_string(),
        429 => "Rate limited by admin API".to_string(),
        s if s >= 500 => format!("Admin API server error (HTTP {s})"),
        s => format!("Unexpected response from admin API (HTTP {s})"),
    }
}

/// Pull `error` / `message` out of a JSON error body, falling back to the
/// generic status text.
fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status_error(status)),
        Err(_) if !body.trim().is_empty() => format!("{}: {}", status_error(status), body.trim()),
        Err(_) => status_error(status),
    }
}

// ---------------------------------------------------------------------------
// Batch push
// ---------------------------------------------------------------------------

/// Per-record verdict from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub idempotency_key: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct BatchRecord<'a> {
    idempotency_key: &'a str,
    entity_type: &'a str,
    entity_id: &'a str,
    payload: Value,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    tenant_id: &'a str,
    device_id: &'a str,
    records: Vec<BatchRecord<'a>>,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<RecordOutcome>,
}

/// Remote side of reconciliation.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Push a batch; the result carries one outcome per record the remote
    /// side recognised. Records missing from the result count as rejected.
    async fn push_batch(&self, records: &[PendingRecord]) -> Result<Vec<RecordOutcome>, ApiError>;
}

pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    api_key: String,
    tenant_id: String,
    device_id: String,
}

impl HttpRemoteApi {
    pub fn new(
        admin_url: &str,
        api_key: &str,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Self, ApiError> {
        let base_url = normalize_admin_url(admin_url);
        if base_url.is_empty() {
            return Err(ApiError::NotConfigured("admin_url"));
        }
        let api_key = extract_api_key_from_connection_string(api_key)
            .unwrap_or_else(|| api_key.trim().to_string());
        if api_key.is_empty() {
            return Err(ApiError::NotConfigured("api_key"));
        }
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            tenant_id: tenant_id.to_string(),
            device_id: device_id.to_string(),
        })
    }
}

fn build_request<'a>(tenant_id: &'a str, device_id: &'a str, records: &'a [PendingRecord]) -> BatchRequest<'a> {
    BatchRequest {
        tenant_id,
        device_id,
        records: records
            .iter()
            .map(|r| BatchRecord {
                idempotency_key: &r.idempotency_key,
                entity_type: &r.entity_type,
                entity_id: &r.entity_id,
                payload: serde_json::from_str(&r.payload)
                    .unwrap_or_else(|_| Value::String(r.payload.clone())),
            })
            .collect(),
    }
}

fn parse_batch_response(body: &str) -> Result<Vec<RecordOutcome>, ApiError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<BatchResponse>(body)
        .map(|r| r.results)
        .map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn push_batch(&self, records: &[PendingRecord]) -> Result<Vec<RecordOutcome>, ApiError> {
        let url = format!("{}{}", self.base_url, BATCH_PATH);
        let body = build_request(&self.tenant_id, &self.device_id, records);

        let resp = self
            .client
            .post(&url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-device-id", &self.device_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Network(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let message = error_message(status, &text);
            warn!(status = status.as_u16(), %message, "batch push rejected");
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let outcomes = parse_batch_response(&text)?;
        debug!(sent = records.len(), results = outcomes.len(), "batch pushed");
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, payload: &str) -> PendingRecord {
        PendingRecord {
            id,
            entity_type: "order".into(),
            entity_id: format!("o{id}"),
            payload: payload.into(),
            idempotency_key: format!("order:o{id}"),
            revision: 1,
            retry_count: 0,
        }
    }

    #[test]
    fn normalizes_admin_urls() {
        assert_eq!(normalize_admin_url("admin.example.com/api/"), "https://admin.example.com");
        assert_eq!(normalize_admin_url("localhost:3001"), "http://localhost:3001");
        assert_eq!(normalize_admin_url("https://x.io///"), "https://x.io");
        assert_eq!(normalize_admin_url("  "), "");
    }

    #[test]
    fn decodes_raw_json_connection_string() {
        let raw = r#"{"key":"k1","tenantId":"t1","url":"x.io"}"#;
        assert_eq!(extract_api_key_from_connection_string(raw).as_deref(), Some("k1"));
        assert_eq!(extract_tenant_id_from_connection_string(raw).as_deref(), Some("t1"));
        assert_eq!(extract_admin_url_from_connection_string(raw).as_deref(), Some("https://x.io"));
        assert_eq!(extract_api_key_from_connection_string("short-plain-key"), None);
    }

    #[test]
    fn request_embeds_json_payloads() {
        let records = vec![record(1, r#"{"orderId":"o1"}"#), record(2, "not json")];
        let body = serde_json::to_value(build_request("t", "d", &records)).unwrap();
        assert_eq!(body["tenant_id"], "t");
        assert_eq!(body["records"][0]["payload"]["orderId"], "o1");
        assert_eq!(body["records"][1]["payload"], "not json");
        assert_eq!(body["records"][1]["idempotency_key"], "order:o2");
    }

    #[test]
    fn parses_partial_results() {
        let body = r#"{"results":[{"idempotency_key":"order:o1","accepted":true},
                                  {"idempotency_key":"order:o2","accepted":false,"error":"bad total"}]}"#;
        let outcomes = parse_batch_response(body).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].accepted);
        assert_eq!(outcomes[1].error.as_deref(), Some("bad total"));
        assert!(parse_batch_response("").unwrap().is_empty());
        assert!(matches!(parse_batch_response("<html>"), Err(ApiError::InvalidResponse(_))));
    }

    #[test]
    fn error_body_message_is_preferred() {
        let msg = error_message(StatusCode::UNPROCESSABLE_ENTITY, r#"{"error":"tenant disabled"}"#);
        assert_eq!(msg, "tenant disabled");
        let msg = error_message(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(msg, "Admin API server error (HTTP 503)");
    }

    #[test]
    fn http_client_requires_url_and_key() {
        assert!(matches!(
            HttpRemoteApi::new("", "k", "t", "d"),
            Err(ApiError::NotConfigured("admin_url"))
        ));
        assert!(matches!(
            HttpRemoteApi::new("x.io", " ", "t", "d"),
            Err(ApiError::NotConfigured("api_key"))
        ));
    }
}
