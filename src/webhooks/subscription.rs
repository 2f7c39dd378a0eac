//! Subscription-billing `charge/paid` and `charge/refunded` deliveries.

use axum::{
    Extension,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::storefront::{record_order, record_refund};
use super::{DiscountCodeRef, accept, flexible_id, flexible_id_opt};
use crate::api::AppState;
use crate::attribution::{AttributionOutcome, OrderEvent, RefundEvent, RefundOutcome};
use crate::customer::CustomerKeys;
use crate::error::ApiErrorWithMeta;
use crate::responses::{ApiOk, RequestMeta};
use crate::types::OrderSource;

const SOURCE: &str = "subscription";

#[derive(Debug, Default, Deserialize)]
pub struct ExternalIds {
    #[serde(default, deserialize_with = "flexible_id_opt")]
    pub ecommerce: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChargeCustomer {
    #[serde(default, deserialize_with = "flexible_id_opt")]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub external_customer_id: ExternalIds,
}

#[derive(Debug, Deserialize)]
pub struct Charge {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(default)]
    pub customer: ChargeCustomer,
    #[serde(default)]
    pub external_order_id: ExternalIds,
    #[serde(default)]
    pub subtotal_price: Option<Decimal>,
    #[serde(default)]
    pub total_price: Option<Decimal>,
    #[serde(default)]
    pub discount_codes: Vec<DiscountCodeRef>,
    /// `CHECKOUT` for the first charge, `RECURRING` for renewals.
    #[serde(default, rename = "type")]
    pub charge_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChargeEnvelope {
    pub charge: Charge,
}

impl Charge {
    /// The storefront order id when the charge produced one, so a charge and
    /// its storefront order dedup against each other.
    pub fn order_key(&self) -> String {
        self.external_order_id
            .ecommerce
            .clone()
            .unwrap_or_else(|| format!("charge-{}", self.id))
    }

    pub fn is_recurring(&self) -> bool {
        self.charge_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("recurring"))
    }

    pub fn into_event(self) -> OrderEvent {
        let total = self.total_price.unwrap_or_default();
        OrderEvent {
            order_id: self.order_key(),
            source: OrderSource::Subscription,
            is_recurring: self.is_recurring(),
            discount_codes: self.discount_codes.into_iter().map(|d| d.code).collect(),
            customer: CustomerKeys::new(
                self.customer.external_customer_id.ecommerce,
                self.customer.id,
                self.customer.email,
            ),
            subtotal: self.subtotal_price.unwrap_or(total),
            total,
        }
    }
}

pub async fn charges_paid_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiOk<AttributionOutcome>, ApiErrorWithMeta> {
    let payload: ChargeEnvelope =
        accept(&st.verifiers.subscription, &st.diagnostics, SOURCE, &headers, &body, &meta).await?;
    record_order(&st, payload.charge.into_event(), meta).await
}

pub async fn charges_refunded_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiOk<RefundOutcome>, ApiErrorWithMeta> {
    let payload: ChargeEnvelope =
        accept(&st.verifiers.subscription, &st.diagnostics, SOURCE, &headers, &body, &meta).await?;
    let charge = payload.charge;
    record_refund(
        &st,
        RefundEvent {
            order_id: charge.order_key(),
            source: OrderSource::Subscription,
            refund_id: Some(charge.id),
        },
        meta,
    )
    .await
}
