//! Payment disbursement processor: batch creation, batch/item status, and
//! OAuth client-credential token caching.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backoff::Backoff;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub receiver: String,
    pub amount: Decimal,
    /// Our idempotency tag for the item; the payout id.
    pub sender_item_id: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub sender_batch_id: String,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub batch_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteItemStatus {
    Succeeded,
    Failed,
    InFlight,
}

/// Maps the processor's item status vocabulary onto terminal/in-flight.
pub fn classify_item_status(status: &str) -> RemoteItemStatus {
    match status.to_ascii_uppercase().as_str() {
        "SUCCESS" | "SUCCEEDED" | "COMPLETED" => RemoteItemStatus::Succeeded,
        "FAILED" | "RETURNED" | "BLOCKED" | "REFUNDED" | "REVERSED" | "DENIED" | "CANCELED" => {
            RemoteItemStatus::Failed
        }
        _ => RemoteItemStatus::InFlight,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub item_id: String,
    pub sender_item_id: Option<String>,
    pub status: RemoteItemStatus,
    pub raw_status: String,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatus {
    pub batch_id: String,
    pub batch_status: String,
    pub items: Vec<RemoteItem>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("processor returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected processor response: {0}")]
    Decode(String),
    /// The batch may or may not exist on the processor side: the submission
    /// timed out, failed mid-flight, or was refused as a duplicate.
    #[error("batch submission outcome unknown: {0}")]
    OutcomeUnknown(String),
    #[error("payment processor is not configured")]
    NotConfigured,
}

impl ProcessorError {
    /// Timeouts, connection failures, 401 (stale token), 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status == 401 || *status == 429 || *status >= 500,
            Self::Decode(_) | Self::OutcomeUnknown(_) | Self::NotConfigured => false,
        }
    }

    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, Self::OutcomeUnknown(_))
    }
}

/// Body markers the processor uses when a `sender_batch_id` was already accepted.
const DUPLICATE_BATCH_MARKERS: [&str; 2] = ["DUPLICATE_REQUEST_ID", "SENDER_BATCH_ID_ALREADY_USED"];

/// Reclassifies a failed batch submission: anything that may have reached
/// the processor becomes `OutcomeUnknown`.
fn submission_error(e: ProcessorError) -> ProcessorError {
    match e {
        ProcessorError::Http(err) if err.is_connect() || err.is_builder() => ProcessorError::Http(err),
        ProcessorError::Http(err) => ProcessorError::OutcomeUnknown(err.to_string()),
        ProcessorError::Status { status, body } if status >= 500 => {
            ProcessorError::OutcomeUnknown(format!("processor returned {status}: {body}"))
        }
        ProcessorError::Status { status, body }
            if DUPLICATE_BATCH_MARKERS.iter().any(|m| body.contains(m)) =>
        {
            ProcessorError::OutcomeUnknown(format!("processor reported a duplicate batch ({status}): {body}"))
        }
        ProcessorError::Decode(msg) => ProcessorError::OutcomeUnknown(format!("unreadable batch receipt: {msg}")),
        other => other,
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Submits a batch. Irrevocable once it returns `Ok`.
    async fn create_batch(&self, batch: &BatchRequest) -> Result<BatchReceipt, ProcessorError>;
    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, ProcessorError>;
}

/// Stands in when no processor credentials are configured; every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredProcessor;

#[async_trait]
impl PaymentProcessor for UnconfiguredProcessor {
    async fn create_batch(&self, _batch: &BatchRequest) -> Result<BatchReceipt, ProcessorError> {
        Err(ProcessorError::NotConfigured)
    }

    async fn batch_status(&self, _batch_id: &str) -> Result<BatchStatus, ProcessorError> {
        Err(ProcessorError::NotConfigured)
    }
}

/// An access token and the instant it stops being usable.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: Instant,
}

impl CachedToken {
    pub fn is_fresh(&self, now: Instant, skew: Duration) -> bool {
        now + skew < self.expires_at
    }
}

/// Holds one access token until shortly before it expires.
#[derive(Debug)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
    skew: Duration,
}

impl TokenCache {
    pub fn new(skew: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            skew,
        }
    }

    /// Returns the cached token, or runs `fetch` and caches its result. The
    /// lock is held across `fetch` so concurrent callers share one exchange.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, ProcessorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken, ProcessorError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh(Instant::now(), self.skew) {
                return Ok(cached.token.clone());
            }
        }
        let fresh = fetch().await?;
        let token = fresh.token.clone();
        *slot = Some(fresh);
        Ok(token)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct BatchHeader {
    payout_batch_id: String,
    #[serde(default)]
    batch_status: String,
}

#[derive(Deserialize)]
struct CreateBatchResponse {
    batch_header: BatchHeader,
}

#[derive(Deserialize)]
struct ItemErrors {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct PayoutItemBody {
    #[serde(default)]
    sender_item_id: Option<String>,
}

#[derive(Deserialize)]
struct BatchItemResponse {
    payout_item_id: String,
    #[serde(default)]
    transaction_status: Option<String>,
    #[serde(default)]
    payout_item: Option<PayoutItemBody>,
    #[serde(default)]
    errors: Option<ItemErrors>,
}

#[derive(Deserialize)]
struct BatchStatusResponse {
    batch_header: BatchHeader,
    #[serde(default)]
    items: Vec<BatchItemResponse>,
}

/// PayPal-style payouts API client.
pub struct PaypalClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    tokens: TokenCache,
    backoff: Backoff,
}

impl PaypalClient {
    pub fn new(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
        timeout: Duration,
        backoff: Backoff,
    ) -> Result<Self, ProcessorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            tokens: TokenCache::new(Duration::from_secs(60)),
            backoff,
        })
    }

    async fn access_token(&self) -> Result<String, ProcessorError> {
        self.tokens
            .get_or_fetch(|| async {
                debug!("exchanging processor client credentials");
                let resp = self
                    .client
                    .post(format!("{}/v1/oauth2/token", self.base_url))
                    .basic_auth(&self.client_id, Some(&self.client_secret))
                    .form(&[("grant_type", "client_credentials")])
                    .send()
                    .await?;
                let resp = check_status(resp).await?;
                let body: TokenResponse = resp
                    .json()
                    .await
                    .map_err(|e| ProcessorError::Decode(e.to_string()))?;
                Ok::<_, ProcessorError>(CachedToken {
                    token: body.access_token,
                    expires_at: Instant::now() + Duration::from_secs(body.expires_in),
                })
            })
            .await
    }

    async fn authorized(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ProcessorError> {
        let token = self.access_token().await?;
        let resp = req.bearer_auth(token).send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        check_status(resp).await
    }

    async fn try_create_batch(&self, batch: &BatchRequest) -> Result<BatchReceipt, ProcessorError> {
        let items: Vec<_> = batch
            .items
            .iter()
            .map(|item| {
                json!({
                    "recipient_type": "EMAIL",
                    "receiver": item.receiver,
                    "sender_item_id": item.sender_item_id,
                    "note": item.note,
                    "amount": { "value": format!("{:.2}", item.amount), "currency": "USD" },
                })
            })
            .collect();
        let body = json!({
            "sender_batch_header": {
                "sender_batch_id": batch.sender_batch_id,
                "email_subject": "You have a commission payout",
            },
            "items": items,
        });

        let token = self.access_token().await?;
        let resp = self
            .client
            .post(format!("{}/v1/payments/payouts", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| submission_error(e.into()))?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let resp = check_status(resp).await.map_err(submission_error)?;
        let created: CreateBatchResponse = resp
            .json()
            .await
            .map_err(|e| submission_error(ProcessorError::Decode(e.to_string())))?;

        info!(
            batch_id = %created.batch_header.payout_batch_id,
            items = batch.items.len(),
            "payout batch submitted"
        );
        Ok(BatchReceipt {
            batch_id: created.batch_header.payout_batch_id,
            batch_status: created.batch_header.batch_status,
        })
    }

    async fn try_batch_status(&self, batch_id: &str) -> Result<BatchStatus, ProcessorError> {
        let resp = self
            .authorized(
                self.client
                    .get(format!("{}/v1/payments/payouts/{}", self.base_url, batch_id)),
            )
            .await?;
        let body: BatchStatusResponse = resp
            .json()
            .await
            .map_err(|e| ProcessorError::Decode(e.to_string()))?;

        let items = body
            .items
            .into_iter()
            .map(|item| {
                let raw_status = item
                    .transaction_status
                    .unwrap_or_else(|| "PENDING".to_string());
                let failure_reason = item
                    .errors
                    .and_then(|e| e.message.or(e.name))
                    .or_else(|| {
                        (classify_item_status(&raw_status) == RemoteItemStatus::Failed)
                            .then(|| format!("item {}", raw_status.to_lowercase()))
                    });
                RemoteItem {
                    status: classify_item_status(&raw_status),
                    item_id: item.payout_item_id,
                    sender_item_id: item.payout_item.and_then(|p| p.sender_item_id),
                    raw_status,
                    failure_reason,
                }
            })
            .collect();

        Ok(BatchStatus {
            batch_id: body.batch_header.payout_batch_id,
            batch_status: body.batch_header.batch_status,
            items,
        })
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProcessorError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProcessorError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl PaymentProcessor for PaypalClient {
    async fn create_batch(&self, batch: &BatchRequest) -> Result<BatchReceipt, ProcessorError> {
        // OutcomeUnknown is not retryable, so a batch is never sent twice.
        self.backoff
            .retry("processor.create_batch", ProcessorError::is_retryable, || {
                self.try_create_batch(batch)
            })
            .await
    }

    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, ProcessorError> {
        self.backoff
            .retry("processor.batch_status", ProcessorError::is_retryable, || {
                self.try_batch_status(batch_id)
            })
            .await
    }
}
