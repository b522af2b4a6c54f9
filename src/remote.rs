//! Remote sync endpoint.
//!
//! Batches are POSTed to the admin dashboard at `/api/pos/orders/sync`. The
//! dashboard answers per operation; the answer is mapped back onto the local
//! queue sequence numbers here so the dispatcher never sees wire ids.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RemoteConfig;
use crate::error::{PosError, PosResult};
use crate::order::Order;
use crate::queue::{SyncOpType, SyncOperation};

const SYNC_PATH: &str = "/api/pos/orders/sync";
const HEALTH_PATH: &str = "/api/health";

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation<'a> {
    /// Idempotency key of the operation (not the local sequence number).
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: SyncOpType,
    pub payload: &'a Order,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct SyncBatchRequest<'a> {
    pub operations: Vec<WireOperation<'a>>,
}

impl<'a> SyncBatchRequest<'a> {
    pub fn from_batch(batch: &'a [SyncOperation]) -> Self {
        Self {
            operations: batch
                .iter()
                .map(|op| WireOperation {
                    id: op.idempotency_key(),
                    op_type: op.op_type,
                    payload: &op.payload,
                    timestamp: op.timestamp,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Acknowledged,
    RejectedPermanent,
    RejectedTransient,
    Conflict,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteResult {
    pub id: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncBatchResponse {
    /// Absent when the endpoint only acknowledges whole batches.
    #[serde(default)]
    pub results: Option<Vec<RemoteResult>>,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Acknowledged,
    RejectedPermanent(String),
    RejectedTransient(String),
    Conflict(String),
}

/// Per-operation result of one shipped batch, keyed by local sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub outcomes: HashMap<i64, OperationOutcome>,
}

impl BatchOutcome {
    pub fn acknowledge_all(batch: &[SyncOperation]) -> Self {
        Self {
            outcomes: batch
                .iter()
                .map(|op| (op.id, OperationOutcome::Acknowledged))
                .collect(),
        }
    }

    /// Outcome for `op_id`; operations the remote did not mention stay queued.
    pub fn get(&self, op_id: i64) -> OperationOutcome {
        self.outcomes
            .get(&op_id)
            .cloned()
            .unwrap_or_else(|| {
                OperationOutcome::RejectedTransient("no result reported by remote".to_string())
            })
    }
}

/// Map a remote response onto the shipped batch.
///
/// Only an explicit `rejected_permanent` or `conflict` entry takes an
/// operation out of the retry path.
pub fn resolve_outcomes(batch: &[SyncOperation], response: SyncBatchResponse) -> BatchOutcome {
    let Some(results) = response.results else {
        return BatchOutcome::acknowledge_all(batch);
    };

    let by_key: HashMap<String, i64> = batch
        .iter()
        .map(|op| (op.idempotency_key(), op.id))
        .collect();

    let mut outcomes = HashMap::with_capacity(results.len());
    for result in results {
        let Some(&op_id) = by_key.get(&result.id) else {
            warn!(remote_id = %result.id, "Remote reported a result for an unknown operation");
            continue;
        };
        let reason = result
            .error
            .unwrap_or_else(|| "no reason given".to_string());
        let outcome = match result.status {
            RemoteStatus::Acknowledged => OperationOutcome::Acknowledged,
            RemoteStatus::RejectedPermanent => OperationOutcome::RejectedPermanent(reason),
            RemoteStatus::RejectedTransient => OperationOutcome::RejectedTransient(reason),
            RemoteStatus::Conflict => OperationOutcome::Conflict(reason),
        };
        outcomes.insert(op_id, outcome);
    }
    BatchOutcome { outcomes }
}

// ---------------------------------------------------------------------------
// Client seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Ship one batch as a single request. `Err` means nothing is known about
    /// any operation in the batch.
    async fn push_batch(&self, batch: &[SyncOperation]) -> PosResult<BatchOutcome>;

    /// Lightweight reachability check used by the connectivity probe.
    async fn is_reachable(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// URL normalisation and error mapping
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
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

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Convert a `reqwest::Error` into a readable transient failure.
fn friendly_error(url: &str, err: &reqwest::Error) -> PosError {
    let message = if err.is_connect() {
        format!("Cannot reach admin dashboard at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid admin dashboard URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    PosError::TransientSync(message)
}

/// Any non-2xx answer is transient: permanent rejection must come from an
/// explicit per-operation result, never from a status code.
fn status_error(status: StatusCode, body: &str) -> PosError {
    let summary = match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        429 => "Admin dashboard is rate limiting sync".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    };
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.chars().take(200).collect())
        });
    match detail {
        Some(detail) => PosError::TransientSync(format!("{summary}: {detail}")),
        None => PosError::TransientSync(summary),
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct HttpSyncClient {
    client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
    connectivity_timeout: Duration,
}

impl HttpSyncClient {
    pub fn new(config: &RemoteConfig) -> PosResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PosError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_admin_url(&config.admin_url),
            api_key: config.api_key.clone(),
            terminal_id: config.terminal_id.clone(),
            connectivity_timeout: config.connectivity_timeout,
        })
    }
}

#[async_trait]
impl RemoteSyncClient for HttpSyncClient {
    async fn push_batch(&self, batch: &[SyncOperation]) -> PosResult<BatchOutcome> {
        let url = format!("{}{SYNC_PATH}", self.base_url);
        let body = SyncBatchRequest::from_batch(batch);

        let resp = self
            .client
            .post(&url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        // An empty 2xx body is a whole-batch acknowledgement.
        let parsed = if text.trim().is_empty() {
            SyncBatchResponse::default()
        } else {
            serde_json::from_str::<SyncBatchResponse>(&text).map_err(|e| {
                PosError::TransientSync(format!("Unreadable sync response: {e}"))
            })?
        };

        info!(operations = batch.len(), "Sync batch accepted by admin dashboard");
        Ok(resolve_outcomes(batch, parsed))
    }

    async fn is_reachable(&self) -> bool {
        let health_url = format!("{}{HEALTH_PATH}", self.base_url);
        match self
            .client
            .head(&health_url)
            .header("X-POS-API-Key", &self.api_key)
            .timeout(self.connectivity_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
