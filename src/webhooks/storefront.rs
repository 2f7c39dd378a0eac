//! Storefront `orders/paid` and `refunds/create` deliveries.

use axum::{
    Extension,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use super::{DiscountCodeRef, accept, flexible_id, flexible_id_opt, invalid_event, processing_failure};
use crate::api::AppState;
use crate::attribution::{AttributionError, AttributionOutcome, OrderEvent, RefundEvent, RefundOutcome};
use crate::customer::CustomerKeys;
use crate::error::ApiErrorWithMeta;
use crate::responses::{ApiOk, RequestMeta};
use crate::types::OrderSource;

const SOURCE: &str = "storefront";

#[derive(Debug, Deserialize)]
pub struct OrderCustomer {
    #[serde(default, deserialize_with = "flexible_id_opt")]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderPaid {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub customer: Option<OrderCustomer>,
    pub subtotal_price: Decimal,
    pub total_price: Decimal,
    #[serde(default)]
    pub discount_codes: Vec<DiscountCodeRef>,
}

impl OrderPaid {
    pub fn into_event(self) -> OrderEvent {
        let (customer_id, customer_email) = match self.customer {
            Some(c) => (c.id, c.email),
            None => (None, None),
        };
        OrderEvent {
            order_id: self.id,
            source: OrderSource::Storefront,
            discount_codes: self.discount_codes.into_iter().map(|d| d.code).collect(),
            customer: CustomerKeys::new(customer_id, None, self.email.or(customer_email)),
            subtotal: self.subtotal_price,
            total: self.total_price,
            is_recurring: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RefundCreated {
    #[serde(default, deserialize_with = "flexible_id_opt")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "flexible_id_opt")]
    pub order_id: Option<String>,
}

pub async fn orders_paid_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiOk<AttributionOutcome>, ApiErrorWithMeta> {
    let payload: OrderPaid = accept(&st.verifiers.storefront, &st.diagnostics, SOURCE, &headers, &body, &meta).await?;
    let event = payload.into_event();
    record_order(&st, event, meta).await
}

/// Shared by both order sources once their payloads are normalized.
pub(crate) async fn record_order(
    st: &AppState,
    event: OrderEvent,
    meta: RequestMeta,
) -> Result<ApiOk<AttributionOutcome>, ApiErrorWithMeta> {
    let source = event.source.as_str();
    match st.attribution.record_order(&event, Utc::now()).await {
        Ok(outcome) => Ok(ApiOk::ok("order processed", outcome, meta)),
        Err(e @ AttributionError::InvalidOrder { .. }) => Err(invalid_event(&st.diagnostics, source, &meta, e).await),
        Err(e) => Err(processing_failure(
            &st.diagnostics,
            source,
            &meta,
            e,
            json!({ "order_id": event.order_id, "order_source": event.source }),
        )
        .await),
    }
}

pub async fn refunds_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiOk<RefundOutcome>, ApiErrorWithMeta> {
    let payload: RefundCreated = accept(&st.verifiers.storefront, &st.diagnostics, SOURCE, &headers, &body, &meta).await?;
    let Some(order_id) = payload.order_id else {
        return Err(invalid_event(&st.diagnostics, SOURCE, &meta, "refund has no order_id").await);
    };
    record_refund(
        &st,
        RefundEvent {
            order_id,
            source: OrderSource::Storefront,
            refund_id: payload.id,
        },
        meta,
    )
    .await
}

pub(crate) async fn record_refund(
    st: &AppState,
    refund: RefundEvent,
    meta: RequestMeta,
) -> Result<ApiOk<RefundOutcome>, ApiErrorWithMeta> {
    let source = refund.source.as_str();
    match st.attribution.record_refund(&refund, Utc::now()).await {
        Ok(outcome) => Ok(ApiOk::ok("refund processed", outcome, meta)),
        Err(e) => Err(processing_failure(
            &st.diagnostics,
            source,
            &meta,
            e,
            json!({ "order_id": refund.order_id, "refund_id": refund.refund_id }),
        )
        .await),
    }
}
