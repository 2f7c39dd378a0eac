//! Disbursement processor payout-status events.

use axum::{
    Extension,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::{accept, invalid_event, processing_failure};
use crate::api::AppState;
use crate::error::ApiErrorWithMeta;
use crate::reconcile::{DisbursementEvent, EventOutcome};
use crate::responses::{ApiOk, RequestMeta};

const SOURCE: &str = "disbursement";
const ITEM_EVENT_PREFIX: &str = "PAYMENT.PAYOUTS-ITEM.";
const BATCH_EVENT_PREFIX: &str = "PAYMENT.PAYOUTSBATCH.";

#[derive(Debug, Default, Deserialize)]
pub struct PayoutItemRef {
    #[serde(default)]
    pub sender_item_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemErrors {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchHeader {
    #[serde(default)]
    pub payout_batch_id: Option<String>,
    #[serde(default)]
    pub batch_status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub payout_item_id: Option<String>,
    #[serde(default)]
    pub transaction_status: Option<String>,
    #[serde(default)]
    pub payout_batch_id: Option<String>,
    #[serde(default)]
    pub payout_item: Option<PayoutItemRef>,
    #[serde(default)]
    pub errors: Option<ItemErrors>,
    #[serde(default)]
    pub batch_header: Option<BatchHeader>,
}

#[derive(Debug, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub resource: Resource,
}

impl Notification {
    /// `Err` carries the reason an item or batch event is unusable.
    pub fn into_event(self) -> Result<DisbursementEvent, String> {
        let event_type = self.event_type;
        let resource = self.resource;
        if event_type.starts_with(ITEM_EVENT_PREFIX) {
            let item_id = resource
                .payout_item_id
                .ok_or_else(|| format!("{event_type} without payout_item_id"))?;
            return Ok(DisbursementEvent::Item {
                event_type,
                item_id,
                sender_item_id: resource.payout_item.and_then(|p| p.sender_item_id),
                transaction_status: resource.transaction_status,
                failure_reason: resource.errors.and_then(|e| e.message.or(e.name)),
            });
        }
        if event_type.starts_with(BATCH_EVENT_PREFIX) {
            let header = resource.batch_header.unwrap_or_default();
            let batch_id = header
                .payout_batch_id
                .or(resource.payout_batch_id)
                .ok_or_else(|| format!("{event_type} without payout_batch_id"))?;
            return Ok(DisbursementEvent::Batch {
                event_type,
                batch_id,
                batch_status: header.batch_status,
            });
        }
        Ok(DisbursementEvent::Other { event_type })
    }
}

pub async fn disbursements_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiOk<EventOutcome>, ApiErrorWithMeta> {
    let payload: Notification =
        accept(&st.verifiers.disbursement, &st.diagnostics, SOURCE, &headers, &body, &meta).await?;
    let notification_id = payload.id.clone();
    let event = match payload.into_event() {
        Ok(event) => event,
        Err(reason) => return Err(invalid_event(&st.diagnostics, SOURCE, &meta, reason).await),
    };

    match st.reconciler.handle_event(&event, Utc::now()).await {
        Ok(outcome) => Ok(ApiOk::ok("event processed", outcome, meta)),
        Err(e) => Err(processing_failure(
            &st.diagnostics,
            SOURCE,
            &meta,
            e,
            json!({ "notification_id": notification_id, "event": format!("{event:?}") }),
        )
        .await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_event_normalizes() {
        let n: Notification = serde_json::from_str(
            r#"{
                "id": "WH-1",
                "event_type": "PAYMENT.PAYOUTS-ITEM.FAILED",
                "resource": {
                    "payout_item_id": "ITEM-1",
                    "transaction_status": "FAILED",
                    "payout_batch_id": "BATCH-1",
                    "payout_item": {"sender_item_id": "abc"},
                    "errors": {"name": "RECEIVER_UNREGISTERED", "message": "Receiver is unregistered"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            n.into_event().unwrap(),
            DisbursementEvent::Item {
                event_type: "PAYMENT.PAYOUTS-ITEM.FAILED".into(),
                item_id: "ITEM-1".into(),
                sender_item_id: Some("abc".into()),
                transaction_status: Some("FAILED".into()),
                failure_reason: Some("Receiver is unregistered".into()),
            }
        );
    }

    #[test]
    fn batch_event_reads_header() {
        let n: Notification = serde_json::from_str(
            r#"{"event_type": "PAYMENT.PAYOUTSBATCH.DENIED",
                "resource": {"batch_header": {"payout_batch_id": "B-7", "batch_status": "DENIED"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            n.into_event().unwrap(),
            DisbursementEvent::Batch { batch_id, .. } if batch_id == "B-7"
        ));
    }

    #[test]
    fn item_event_without_item_id_is_invalid() {
        let n: Notification =
            serde_json::from_str(r#"{"event_type": "PAYMENT.PAYOUTS-ITEM.SUCCEEDED", "resource": {}}"#).unwrap();
        assert!(n.into_event().is_err());

        let other: Notification = serde_json::from_str(r#"{"event_type": "CUSTOMER.DISPUTE.CREATED"}"#).unwrap();
        assert!(matches!(other.into_event(), Ok(DisbursementEvent::Other { .. })));
    }
}
