//! Fire-and-forget events to the marketing/notification platform.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    AffiliateSignup,
    AffiliateApproved,
    ReferralCreated,
    TierUpgraded,
    PayoutSent,
}

impl EventName {
    /// Metric name as it appears on the notification platform.
    pub fn metric(&self) -> &'static str {
        match self {
            Self::AffiliateSignup => "Affiliate Signup",
            Self::AffiliateApproved => "Affiliate Approved",
            Self::ReferralCreated => "Affiliate Referral",
            Self::TierUpgraded => "Affiliate Tier Upgraded",
            Self::PayoutSent => "Affiliate Payout Sent",
        }
    }
}

/// A named event about one profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub event: EventName,
    pub email: String,
    pub external_id: Option<String>,
    pub properties: serde_json::Value,
}

impl Notification {
    pub fn new(event: EventName, email: impl Into<String>, properties: serde_json::Value) -> Self {
        Self {
            event,
            email: email.into(),
            external_id: None,
            properties,
        }
    }

    pub fn external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification platform returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Used when no notification platform is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!(event = ?notification.event, "notifier disabled, dropping event");
        Ok(())
    }
}

pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpNotifier {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        let body = json!({
            "data": {
                "type": "event",
                "attributes": {
                    "metric": { "name": n.event.metric() },
                    "profile": { "email": n.email, "external_id": n.external_id },
                    "properties": n.properties,
                }
            }
        });

        let resp = self
            .client
            .post(format!("{}/api/events", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Sends and swallows failures. Notification outages never fail the caller.
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.send(&notification).await {
        warn!(event = ?notification.event, error = %e, "notification failed");
    }
}
