//! Turns paid orders and refunds into referral ledger rows.
//!
//! The `order_id` unique constraint is the only concurrency control: the
//! up-front lookup skips obvious redeliveries, and a duplicate-key error on
//! the insert itself is treated as the same benign redelivery. Everything
//! after the insert (review entries, recalculation, notifications) is
//! best-effort and never fails the event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commission::commission;
use crate::customer::{CustomerKeys, CustomerResolver};
use crate::diagnostics::DiagnosticSink;
use crate::fraud::{referral_signals, score_referral};
use crate::ledger::{LedgerError, LedgerStore};
use crate::notify::{EventName, Notification, Notifier, notify_best_effort};
use crate::settlement::StatsRecalculator;
use crate::types::{
    Affiliate, AffiliateStatus, OrderSource, Referral, ReferralStatus, ReviewItem, ReviewKind,
    Severity, SystemError,
};

/// A paid order or subscription charge, normalized from its webhook payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderEvent {
    pub order_id: String,
    pub source: OrderSource,
    pub discount_codes: Vec<String>,
    pub customer: CustomerKeys,
    pub subtotal: Decimal,
    pub total: Decimal,
    pub is_recurring: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundEvent {
    pub order_id: String,
    pub source: OrderSource,
    pub refund_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttributionOutcome {
    Duplicate,
    NoAffiliate,
    SelfReferral {
        affiliate_id: Uuid,
    },
    Recorded {
        referral_id: Uuid,
        affiliate_id: Uuid,
        commission_amount: Decimal,
        flagged: bool,
        tier_upgraded_to: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefundOutcome {
    NotAttributed,
    Refunded { referral_id: Uuid },
    /// Already refunded or rejected; nothing to do.
    AlreadyFinal { referral_id: Uuid, status: ReferralStatus },
    /// The commission was already paid out; queued for manual reconciliation.
    NeedsReview { referral_id: Uuid },
}

#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("invalid order {order_id}: {reason}")]
    InvalidOrder { order_id: String, reason: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl AttributionError {
    /// Whether redelivering the event could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidOrder { .. })
    }
}

#[derive(Clone)]
pub struct AttributionService {
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    recalculator: StatsRecalculator,
    diagnostics: DiagnosticSink,
}

impl AttributionService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        recalculator: StatsRecalculator,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            ledger,
            notifier,
            recalculator,
            diagnostics,
        }
    }

    pub async fn record_order(
        &self,
        event: &OrderEvent,
        now: DateTime<Utc>,
    ) -> Result<AttributionOutcome, AttributionError> {
        if self.ledger.find_referral_by_order(&event.order_id).await?.is_some() {
            debug!(order_id = %event.order_id, "order already attributed");
            return Ok(AttributionOutcome::Duplicate);
        }

        if event.subtotal.is_sign_negative() || event.total.is_sign_negative() {
            return Err(AttributionError::InvalidOrder {
                order_id: event.order_id.clone(),
                reason: "negative order amount".into(),
            });
        }

        let Some((affiliate, code)) = self.resolve_affiliate(event).await? else {
            debug!(order_id = %event.order_id, "no approved affiliate for order");
            return Ok(AttributionOutcome::NoAffiliate);
        };

        if let Some(email) = &event.customer.email {
            if email.eq_ignore_ascii_case(affiliate.email.trim()) {
                return Ok(self.reject_self_referral(event, &affiliate, now).await);
            }
        }

        let customer_id = if event.customer.is_empty() {
            None
        } else {
            let resolver = CustomerResolver::new(self.ledger.as_ref());
            let (customer, _) = resolver
                .resolve_or_create(&event.customer, affiliate.id, &event.order_id, now)
                .await?;
            Some(customer.id)
        };

        let rate = affiliate.commission_rate;
        let amount = commission(event.subtotal, rate);
        let signals = referral_signals(self.ledger.as_ref(), affiliate.id, event.total, now).await?;
        let report = score_referral(&signals);

        let referral = Referral {
            id: Uuid::new_v4(),
            affiliate_id: affiliate.id,
            customer_id,
            order_id: event.order_id.clone(),
            order_source: event.source,
            order_subtotal: event.subtotal,
            order_total: event.total,
            commission_rate: rate,
            commission_amount: amount,
            status: ReferralStatus::Pending,
            is_recurring: event.is_recurring,
            payout_id: None,
            discount_code: code,
            created_at: now,
            updated_at: now,
        };

        match self.ledger.insert_referral(&referral).await {
            Ok(()) => {}
            Err(LedgerError::DuplicateOrder(order_id)) => {
                debug!(%order_id, "concurrent delivery already inserted referral");
                return Ok(AttributionOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            order_id = %referral.order_id,
            affiliate_id = %affiliate.id,
            commission = %amount,
            fraud_score = report.score,
            "referral recorded"
        );

        // The row exists from here on; nothing below may fail the event.
        if report.flagged {
            let item = ReviewItem::new(ReviewKind::FraudFlag, json!(report), now)
                .affiliate(affiliate.id)
                .referral(referral.id)
                .order(referral.order_id.clone())
                .score(report.score);
            if let Err(e) = self.ledger.insert_review_item(&item).await {
                self.best_effort_failure("fraud_review_write_failed", &referral, e.to_string())
                    .await;
            }
        }

        let tier_upgraded_to = match self.recalculator.recalculate(affiliate.id, now).await {
            Ok(recalc) => recalc.tier_change.map(|c| c.to.slug),
            Err(e) => {
                self.best_effort_failure("recalculation_failed", &referral, e.to_string())
                    .await;
                None
            }
        };

        notify_best_effort(
            self.notifier.as_ref(),
            Notification::new(
                EventName::ReferralCreated,
                &affiliate.email,
                json!({
                    "order_id": referral.order_id,
                    "order_source": referral.order_source,
                    "commission_amount": referral.commission_amount,
                    "is_recurring": referral.is_recurring,
                }),
            )
            .external_id(affiliate.auth_subject.clone()),
        )
        .await;

        Ok(AttributionOutcome::Recorded {
            referral_id: referral.id,
            affiliate_id: affiliate.id,
            commission_amount: amount,
            flagged: report.flagged,
            tier_upgraded_to,
        })
    }

    /// Storefront orders are attributed by code. Subscription charges follow
    /// the customer the affiliate originally acquired, then fall back to a code
    /// on the charge.
    async fn resolve_affiliate(
        &self,
        event: &OrderEvent,
    ) -> Result<Option<(Affiliate, Option<String>)>, LedgerError> {
        if event.source == OrderSource::Subscription && !event.customer.is_empty() {
            let resolution = CustomerResolver::new(self.ledger.as_ref())
                .resolve(&event.customer)
                .await?;
            if let Some(customer) = resolution.customer() {
                match self.ledger.find_affiliate(customer.affiliate_id).await? {
                    Some(a) if a.status == AffiliateStatus::Approved => {
                        let code = a.discount_code.clone().or(Some(a.referral_code.clone()));
                        return Ok(Some((a, code)));
                    }
                    _ => {
                        debug!(customer_id = %customer.id, "customer's affiliate is not approved");
                    }
                }
            }
        }

        for code in event.discount_codes.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            if let Some(a) = self.ledger.find_approved_affiliate_by_code(code).await? {
                return Ok(Some((a, Some(code.to_string()))));
            }
        }
        Ok(None)
    }

    async fn reject_self_referral(
        &self,
        event: &OrderEvent,
        affiliate: &Affiliate,
        now: DateTime<Utc>,
    ) -> AttributionOutcome {
        warn!(
            order_id = %event.order_id,
            affiliate_id = %affiliate.id,
            "self-referral blocked"
        );
        let item = ReviewItem::new(
            ReviewKind::SelfReferral,
            json!({
                "order_source": event.source,
                "subtotal": event.subtotal,
                "discount_codes": event.discount_codes,
            }),
            now,
        )
        .affiliate(affiliate.id)
        .order(event.order_id.clone());
        match self.ledger.insert_review_item(&item).await {
            Ok(true) => {}
            Ok(false) => debug!(order_id = %event.order_id, "self-referral already queued for review"),
            Err(e) => warn!(error = %e, order_id = %event.order_id, "failed to record self-referral"),
        }
        AttributionOutcome::SelfReferral {
            affiliate_id: affiliate.id,
        }
    }

    pub async fn record_refund(
        &self,
        refund: &RefundEvent,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, AttributionError> {
        // A lost compare-and-set means another writer moved the row; re-read and decide again.
        for _ in 0..3 {
            let Some(referral) = self.ledger.find_referral_by_order(&refund.order_id).await? else {
                debug!(order_id = %refund.order_id, "refund for unattributed order");
                return Ok(RefundOutcome::NotAttributed);
            };

            match referral.status {
                ReferralStatus::Paid => return self.queue_paid_refund(refund, &referral, now).await,
                ReferralStatus::Refunded | ReferralStatus::Rejected => {
                    return Ok(RefundOutcome::AlreadyFinal {
                        referral_id: referral.id,
                        status: referral.status,
                    });
                }
                ReferralStatus::Pending | ReferralStatus::Approved => {
                    let moved = self
                        .ledger
                        .set_referral_status(referral.id, referral.status, ReferralStatus::Refunded, now)
                        .await?;
                    if !moved {
                        continue;
                    }
                    info!(order_id = %refund.order_id, referral_id = %referral.id, "referral refunded");
                    if let Err(e) = self.recalculator.recalculate(referral.affiliate_id, now).await {
                        self.best_effort_failure("recalculation_failed", &referral, e.to_string())
                            .await;
                    }
                    return Ok(RefundOutcome::Refunded {
                        referral_id: referral.id,
                    });
                }
            }
        }

        Err(LedgerError::Conflict(format!(
            "referral for order {} kept changing during refund",
            refund.order_id
        ))
        .into())
    }

    /// The money is already disbursed, so the referral stays `paid` and the
    /// conflict goes to the review queue.
    async fn queue_paid_refund(
        &self,
        refund: &RefundEvent,
        referral: &Referral,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, AttributionError> {
        let item = ReviewItem::new(
            ReviewKind::RefundAfterPayout,
            json!({
                "refund_id": refund.refund_id,
                "order_source": refund.source,
                "commission_amount": referral.commission_amount,
                "payout_id": referral.payout_id,
            }),
            now,
        )
        .affiliate(referral.affiliate_id)
        .referral(referral.id)
        .order(referral.order_id.clone());
        if !self.ledger.insert_review_item(&item).await? {
            debug!(order_id = %referral.order_id, "refund after payout already queued for review");
            return Ok(RefundOutcome::NeedsReview {
                referral_id: referral.id,
            });
        }

        self.diagnostics
            .record(
                SystemError::new(
                    Severity::Warning,
                    "refund_after_payout",
                    "attribution",
                    format!("order {} refunded after commission was paid", referral.order_id),
                )
                .with_context(json!({
                    "referral_id": referral.id,
                    "affiliate_id": referral.affiliate_id,
                    "payout_id": referral.payout_id,
                    "commission_amount": referral.commission_amount,
                })),
            )
            .await;

        Ok(RefundOutcome::NeedsReview {
            referral_id: referral.id,
        })
    }

    async fn best_effort_failure(&self, error_type: &str, referral: &Referral, message: String) {
        self.diagnostics
            .record(
                SystemError::new(Severity::Warning, error_type, "attribution", message).with_context(
                    json!({
                        "referral_id": referral.id,
                        "order_id": referral.order_id,
                        "affiliate_id": referral.affiliate_id,
                    }),
                ),
            )
            .await;
    }
}
