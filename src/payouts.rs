//! Admin-triggered payout runs.
//!
//! Payout rows are reserved before anything is sent to the processor, so the
//! one-open-payout-per-affiliate index arbitrates concurrent runs. A definite
//! processor rejection releases the reservation. A submission whose outcome
//! is unknown, or a batch id that could not be recorded, leaves the rows in
//! `processing` and raises a critical diagnostic for manual reconciliation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::diagnostics::DiagnosticSink;
use crate::ledger::{LedgerError, LedgerStore};
use crate::processor::{BatchItem, BatchRequest, PaymentProcessor, ProcessorError};
use crate::settlement::current_stats;
use crate::types::{Affiliate, Payout, PayoutMethod, PayoutStatus, Severity, SystemError};

#[derive(Debug, thiserror::Error)]
pub enum PayoutError {
    #[error("affiliates without a verified payout destination: {}", join_ids(.0))]
    MissingDestination(Vec<Uuid>),
    #[error("processor rejected the batch: {0}")]
    Processor(#[from] ProcessorError),
    /// The batch may have been created; its payouts stay reserved.
    #[error("outcome of batch {sender_batch_id} is unknown: {source}")]
    OutcomeUnknown {
        sender_batch_id: String,
        source: ProcessorError,
    },
    /// The processor accepted batch `batch_id` but its id was not stored on the payouts.
    #[error("batch {batch_id} was submitted but its payouts were not updated: {source}")]
    PartialWrite { batch_id: String, source: LedgerError },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutRun {
    pub method: PayoutMethod,
    pub batch_id: Option<String>,
    pub payouts: Vec<Payout>,
    /// Requested affiliates left out: unknown, below threshold or with a payout in flight.
    pub skipped: Vec<Uuid>,
}

impl PayoutRun {
    pub fn total(&self) -> Decimal {
        self.payouts.iter().map(|p| p.amount).sum()
    }
}

#[derive(Clone)]
pub struct PayoutOrchestrator {
    ledger: Arc<dyn LedgerStore>,
    processor: Arc<dyn PaymentProcessor>,
    diagnostics: DiagnosticSink,
    min_payout: Decimal,
}

impl PayoutOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        processor: Arc<dyn PaymentProcessor>,
        diagnostics: DiagnosticSink,
        min_payout: Decimal,
    ) -> Self {
        Self {
            ledger,
            processor,
            diagnostics,
            min_payout,
        }
    }

    /// Creates payouts for every eligible affiliate in `affiliate_ids`.
    /// Ineligible affiliates are skipped, not reported as errors.
    pub async fn run(
        &self,
        affiliate_ids: &[Uuid],
        method: PayoutMethod,
        now: DateTime<Utc>,
    ) -> Result<PayoutRun, PayoutError> {
        let mut seen = HashSet::new();
        let mut eligible = Vec::new();
        let mut skipped = Vec::new();

        for &id in affiliate_ids.iter().filter(|id| seen.insert(**id)) {
            match self.eligible_amount(id).await? {
                Some((affiliate, amount)) => eligible.push((affiliate, amount)),
                None => skipped.push(id),
            }
        }

        if method == PayoutMethod::Paypal {
            let missing: Vec<Uuid> = eligible
                .iter()
                .filter(|(a, _)| a.verified_destination().is_none())
                .map(|(a, _)| a.id)
                .collect();
            if !missing.is_empty() {
                return Err(PayoutError::MissingDestination(missing));
            }
        }

        let status = match method {
            PayoutMethod::Paypal => PayoutStatus::Processing,
            PayoutMethod::Manual | PayoutMethod::StoreCredit => PayoutStatus::Pending,
        };
        let mut reserved = Vec::with_capacity(eligible.len());
        let mut receivers = Vec::with_capacity(eligible.len());
        for (affiliate, amount) in &eligible {
            let payout = new_payout(affiliate.id, *amount, method, status, None, now);
            match self.ledger.insert_payout(&payout).await {
                Ok(()) => {
                    receivers.push(affiliate.verified_destination().unwrap_or_default().to_string());
                    reserved.push(payout);
                }
                Err(LedgerError::PayoutInFlight(id)) => {
                    debug!(affiliate_id = %id, "payout reserved by a concurrent run");
                    skipped.push(id);
                }
                Err(e) => {
                    self.release(&reserved, &format!("payout run aborted: {e}")).await;
                    return Err(e.into());
                }
            }
        }

        let run = if method == PayoutMethod::Paypal && !reserved.is_empty() {
            self.submit(reserved, receivers, skipped).await?
        } else {
            PayoutRun {
                method,
                batch_id: None,
                payouts: reserved,
                skipped,
            }
        };
        if run.payouts.is_empty() {
            debug!(requested = affiliate_ids.len(), "no affiliates eligible for payout");
            return Ok(run);
        }

        info!(
            method = %run.method,
            batch_id = ?run.batch_id,
            payouts = run.payouts.len(),
            skipped = run.skipped.len(),
            total = %run.total(),
            "payout run created"
        );
        Ok(run)
    }

    /// The owed balance when the affiliate exists, has no open payout and is
    /// owed at least the minimum.
    async fn eligible_amount(&self, affiliate_id: Uuid) -> Result<Option<(Affiliate, Decimal)>, LedgerError> {
        let Some(affiliate) = self.ledger.find_affiliate(affiliate_id).await? else {
            debug!(%affiliate_id, "payout requested for unknown affiliate");
            return Ok(None);
        };
        if self.ledger.has_open_payout(affiliate_id).await? {
            debug!(%affiliate_id, "affiliate already has a payout in flight");
            return Ok(None);
        }
        let balance = current_stats(self.ledger.as_ref(), affiliate_id).await?.balance_owed;
        if balance < self.min_payout {
            debug!(%affiliate_id, %balance, "balance below payout minimum");
            return Ok(None);
        }
        Ok(Some((affiliate, balance)))
    }

    /// Sends reserved `processing` payouts as one batch. `receivers` is
    /// index-aligned with `payouts`.
    async fn submit(
        &self,
        mut payouts: Vec<Payout>,
        receivers: Vec<String>,
        skipped: Vec<Uuid>,
    ) -> Result<PayoutRun, PayoutError> {
        let request = BatchRequest {
            sender_batch_id: Uuid::new_v4().to_string(),
            items: payouts
                .iter()
                .zip(receivers)
                .map(|(payout, receiver)| BatchItem {
                    receiver,
                    amount: payout.amount,
                    sender_item_id: payout.sender_item_id(),
                    note: "Affiliate commission payout".to_string(),
                })
                .collect(),
        };

        let receipt = match self.processor.create_batch(&request).await {
            Ok(receipt) => receipt,
            Err(source) if source.is_outcome_unknown() => {
                self.diagnostics
                    .record(
                        SystemError::new(
                            Severity::Critical,
                            "payout_submission_unknown",
                            "payouts",
                            format!(
                                "batch {} may have been created; payouts left in processing: {source}",
                                request.sender_batch_id
                            ),
                        )
                        .with_context(json!({
                            "sender_batch_id": request.sender_batch_id,
                            "payouts": payout_context(&payouts),
                        })),
                    )
                    .await;
                return Err(PayoutError::OutcomeUnknown {
                    sender_batch_id: request.sender_batch_id,
                    source,
                });
            }
            Err(source) => {
                self.release(&payouts, &format!("processor rejected the batch: {source}"))
                    .await;
                return Err(source.into());
            }
        };

        let ids: Vec<Uuid> = payouts.iter().map(|p| p.id).collect();
        if let Err(source) = self.ledger.attach_batch(&ids, &receipt.batch_id).await {
            self.diagnostics
                .record(
                    SystemError::new(
                        Severity::Critical,
                        "payout_write_failed",
                        "payouts",
                        format!("batch {} submitted but its id was not recorded: {source}", receipt.batch_id),
                    )
                    .with_context(json!({
                        "batch_id": receipt.batch_id,
                        "sender_batch_id": request.sender_batch_id,
                        "payouts": payout_context(&payouts),
                    })),
                )
                .await;
            return Err(PayoutError::PartialWrite {
                batch_id: receipt.batch_id,
                source,
            });
        }
        for payout in &mut payouts {
            payout.batch_id = Some(receipt.batch_id.clone());
        }

        Ok(PayoutRun {
            method: PayoutMethod::Paypal,
            batch_id: Some(receipt.batch_id),
            payouts,
            skipped,
        })
    }

    /// Fails reserved payouts that were never handed to the processor.
    async fn release(&self, payouts: &[Payout], reason: &str) {
        for payout in payouts {
            let released = Payout {
                status: PayoutStatus::Failed,
                failure_reason: Some(reason.to_string()),
                ..payout.clone()
            };
            if let Err(e) = self.ledger.transition_payout(&released, &PayoutStatus::OPEN).await {
                warn!(payout_id = %payout.id, error = %e, "could not release payout reservation");
            }
        }
    }
}

fn payout_context(payouts: &[Payout]) -> Vec<serde_json::Value> {
    payouts
        .iter()
        .map(|p| {
            json!({
                "payout_id": p.id,
                "affiliate_id": p.affiliate_id,
                "amount": p.amount,
            })
        })
        .collect()
}

fn new_payout(
    affiliate_id: Uuid,
    amount: Decimal,
    method: PayoutMethod,
    status: PayoutStatus,
    batch_id: Option<String>,
    now: DateTime<Utc>,
) -> Payout {
    Payout {
        id: Uuid::new_v4(),
        affiliate_id,
        amount,
        method,
        status,
        batch_id,
        item_id: None,
        failure_reason: None,
        created_at: now,
        completed_at: None,
    }
}
