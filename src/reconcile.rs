//! Drives `processing` payouts to a terminal status, from the periodic poller,
//! the disbursement webhook, or an admin override. All three funnel through
//! [`apply_terminal_status`] and a compare-and-set on the payout row, so
//! whichever source lands first wins and the others are no-ops.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::diagnostics::DiagnosticSink;
use crate::ledger::{LedgerError, LedgerResult, LedgerStore};
use crate::notify::{EventName, Notification, Notifier, notify_best_effort};
use crate::processor::{BatchStatus, PaymentProcessor, ProcessorError, RemoteItemStatus, classify_item_status};
use crate::settlement::StatsRecalculator;
use crate::types::{Payout, PayoutStatus, Severity, SystemError};

/// What the processor (or an operator) says happened to one payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Succeeded { item_id: Option<String> },
    Failed { item_id: Option<String>, reason: String },
    InFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete(Payout),
    Fail(Payout),
    NoOp,
}

/// Pure decision: terminal payouts never move, in-flight outcomes change nothing.
pub fn apply_terminal_status(payout: &Payout, outcome: &RemoteOutcome, now: DateTime<Utc>) -> Transition {
    if payout.status.is_terminal() {
        return Transition::NoOp;
    }
    match outcome {
        RemoteOutcome::InFlight => Transition::NoOp,
        RemoteOutcome::Succeeded { item_id } => Transition::Complete(Payout {
            status: PayoutStatus::Completed,
            item_id: item_id.clone().or_else(|| payout.item_id.clone()),
            completed_at: Some(now),
            failure_reason: None,
            ..payout.clone()
        }),
        RemoteOutcome::Failed { item_id, reason } => Transition::Fail(Payout {
            status: PayoutStatus::Failed,
            item_id: item_id.clone().or_else(|| payout.item_id.clone()),
            failure_reason: Some(reason.clone()),
            ..payout.clone()
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Applied {
    Completed { payout_id: Uuid, referrals_paid: u64 },
    Failed { payout_id: Uuid },
    Unchanged { payout_id: Uuid, status: PayoutStatus },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub batches: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_processing: usize,
    pub errors: usize,
}

/// A disbursement-status notification, normalized from the webhook body.
#[derive(Debug, Clone, PartialEq)]
pub enum DisbursementEvent {
    Item {
        event_type: String,
        item_id: String,
        sender_item_id: Option<String>,
        transaction_status: Option<String>,
        failure_reason: Option<String>,
    },
    Batch {
        event_type: String,
        batch_id: String,
        batch_status: Option<String>,
    },
    Other {
        event_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied(Applied),
    UnknownPayout { item_id: String },
    Batch(PollReport),
    Ignored { event_type: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("payouts can only be overridden to completed or failed, not {0}")]
    InvalidOverride(PayoutStatus),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: Arc<dyn Notifier>,
    recalculator: StatsRecalculator,
    diagnostics: DiagnosticSink,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn Notifier>,
        recalculator: StatsRecalculator,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            ledger,
            processor,
            notifier,
            recalculator,
            diagnostics,
        }
    }

    /// Applies `outcome` to `payout`. Completion and the referral settlement
    /// commit together; only the caller whose compare-and-set wins notifies.
    pub async fn apply(
        &self,
        payout: &Payout,
        outcome: &RemoteOutcome,
        now: DateTime<Utc>,
    ) -> LedgerResult<Applied> {
        let unchanged = Applied::Unchanged {
            payout_id: payout.id,
            status: payout.status,
        };
        match apply_terminal_status(payout, outcome, now) {
            Transition::NoOp => Ok(unchanged),
            Transition::Complete(updated) => {
                let Some(referrals_paid) = self
                    .ledger
                    .complete_payout(&updated, &PayoutStatus::OPEN, now)
                    .await?
                else {
                    debug!(payout_id = %payout.id, "payout already settled elsewhere");
                    return Ok(self.current(payout).await?);
                };
                info!(
                    payout_id = %payout.id,
                    affiliate_id = %payout.affiliate_id,
                    amount = %payout.amount,
                    referrals_paid,
                    "payout completed"
                );
                self.after_completion(&updated, now).await;
                Ok(Applied::Completed {
                    payout_id: payout.id,
                    referrals_paid,
                })
            }
            Transition::Fail(updated) => {
                if !self.ledger.transition_payout(&updated, &PayoutStatus::OPEN).await? {
                    debug!(payout_id = %payout.id, "payout already settled elsewhere");
                    return Ok(self.current(payout).await?);
                }
                let reason = updated.failure_reason.clone().unwrap_or_default();
                self.diagnostics
                    .record(
                        SystemError::new(Severity::Warning, "payout_failed", "reconcile", reason).with_context(
                            json!({
                                "payout_id": payout.id,
                                "affiliate_id": payout.affiliate_id,
                                "amount": payout.amount,
                                "batch_id": payout.batch_id,
                                "item_id": updated.item_id,
                            }),
                        ),
                    )
                    .await;
                Ok(Applied::Failed { payout_id: payout.id })
            }
        }
    }

    async fn current(&self, payout: &Payout) -> LedgerResult<Applied> {
        let status = self
            .ledger
            .find_payout(payout.id)
            .await?
            .map(|p| p.status)
            .unwrap_or(payout.status);
        Ok(Applied::Unchanged {
            payout_id: payout.id,
            status,
        })
    }

    async fn after_completion(&self, payout: &Payout, now: DateTime<Utc>) {
        if let Err(e) = self.recalculator.recalculate(payout.affiliate_id, now).await {
            self.diagnostics
                .record(
                    SystemError::new(Severity::Warning, "recalculation_failed", "reconcile", e.to_string())
                        .with_context(json!({ "payout_id": payout.id, "affiliate_id": payout.affiliate_id })),
                )
                .await;
        }

        match self.ledger.find_affiliate(payout.affiliate_id).await {
            Ok(Some(affiliate)) => {
                notify_best_effort(
                    self.notifier.as_ref(),
                    Notification::new(
                        EventName::PayoutSent,
                        &affiliate.email,
                        json!({
                            "payout_id": payout.id,
                            "amount": payout.amount,
                            "method": payout.method,
                        }),
                    )
                    .external_id(affiliate.auth_subject.clone()),
                )
                .await;
            }
            Ok(None) => warn!(affiliate_id = %payout.affiliate_id, "completed payout for unknown affiliate"),
            Err(e) => warn!(error = %e, "failed to load affiliate for payout notification"),
        }
    }

    /// One reconciliation pass over every `processing` payout, grouped by batch.
    /// A batch whose status fetch fails is left for the next pass.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> LedgerResult<PollReport> {
        let mut batches: BTreeMap<String, Vec<Payout>> = BTreeMap::new();
        for payout in self.ledger.list_processing_payouts().await? {
            if let Some(batch_id) = payout.batch_id.clone() {
                batches.entry(batch_id).or_default().push(payout);
            }
        }

        let mut report = PollReport::default();
        for (batch_id, payouts) in batches {
            report.batches += 1;
            match self.processor.batch_status(&batch_id).await {
                Ok(status) => self.settle_batch(&status, &payouts, now, &mut report).await?,
                Err(e) => {
                    report.errors += 1;
                    self.diagnostics
                        .record(
                            SystemError::new(
                                Severity::Warning,
                                "batch_status_failed",
                                "reconcile",
                                e.to_string(),
                            )
                            .with_context(json!({ "batch_id": batch_id, "payouts": payouts.len() })),
                        )
                        .await;
                }
            }
        }
        Ok(report)
    }

    async fn settle_batch(
        &self,
        status: &BatchStatus,
        payouts: &[Payout],
        now: DateTime<Utc>,
        report: &mut PollReport,
    ) -> LedgerResult<()> {
        for payout in payouts {
            let outcome = outcome_in_batch(status, payout);
            match self.apply(payout, &outcome, now).await? {
                Applied::Completed { .. } => report.completed += 1,
                Applied::Failed { .. } => report.failed += 1,
                Applied::Unchanged { status, .. } if !status.is_terminal() => report.still_processing += 1,
                Applied::Unchanged { .. } => {}
            }
        }
        Ok(())
    }

    pub async fn handle_event(&self, event: &DisbursementEvent, now: DateTime<Utc>) -> Result<EventOutcome, ReconcileError> {
        match event {
            DisbursementEvent::Item {
                event_type,
                item_id,
                sender_item_id,
                transaction_status,
                failure_reason,
            } => {
                let Some(payout) = self.find_item_payout(item_id, sender_item_id.as_deref()).await? else {
                    warn!(%item_id, %event_type, "disbursement event for unknown payout");
                    return Ok(EventOutcome::UnknownPayout {
                        item_id: item_id.clone(),
                    });
                };
                let raw = transaction_status
                    .clone()
                    .unwrap_or_else(|| event_suffix(event_type).to_string());
                let outcome = remote_outcome(
                    classify_item_status(&raw),
                    Some(item_id.clone()),
                    failure_reason.clone(),
                    &raw,
                );
                Ok(EventOutcome::Applied(self.apply(&payout, &outcome, now).await?))
            }
            DisbursementEvent::Batch {
                event_type,
                batch_id,
                batch_status,
            } => {
                let raw = batch_status
                    .clone()
                    .unwrap_or_else(|| event_suffix(event_type).to_string())
                    .to_ascii_uppercase();
                let payouts: Vec<Payout> = self
                    .ledger
                    .list_processing_payouts()
                    .await?
                    .into_iter()
                    .filter(|p| p.batch_id.as_deref() == Some(batch_id.as_str()))
                    .collect();

                let mut report = PollReport {
                    batches: 1,
                    ..PollReport::default()
                };
                if raw == "DENIED" {
                    let denied = BatchStatus {
                        batch_id: batch_id.clone(),
                        batch_status: raw,
                        items: Vec::new(),
                    };
                    self.settle_batch(&denied, &payouts, now, &mut report).await?;
                } else if !payouts.is_empty() {
                    let status = self.processor.batch_status(batch_id).await?;
                    self.settle_batch(&status, &payouts, now, &mut report).await?;
                }
                Ok(EventOutcome::Batch(report))
            }
            DisbursementEvent::Other { event_type } => {
                debug!(%event_type, "ignoring disbursement event");
                Ok(EventOutcome::Ignored {
                    event_type: event_type.clone(),
                })
            }
        }
    }

    async fn find_item_payout(&self, item_id: &str, sender_item_id: Option<&str>) -> LedgerResult<Option<Payout>> {
        if let Some(id) = sender_item_id.and_then(|s| Uuid::parse_str(s).ok()) {
            if let Some(payout) = self.ledger.find_payout(id).await? {
                return Ok(Some(payout));
            }
        }
        self.ledger.find_payout_by_item_id(item_id).await
    }

    /// Operator correction. Goes through the same terminal-status rules, so a
    /// completed or failed payout cannot be overridden.
    pub async fn override_payout(
        &self,
        payout_id: Uuid,
        status: PayoutStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Applied, ReconcileError> {
        let outcome = match status {
            PayoutStatus::Completed => RemoteOutcome::Succeeded { item_id: None },
            PayoutStatus::Failed => RemoteOutcome::Failed {
                item_id: None,
                reason: reason.clone().unwrap_or_else(|| "failed by administrator".to_string()),
            },
            other => return Err(ReconcileError::InvalidOverride(other)),
        };
        let payout = self
            .ledger
            .find_payout(payout_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("payout", payout_id))?;

        let applied = self.apply(&payout, &outcome, now).await?;
        self.diagnostics
            .record(
                SystemError::new(
                    Severity::Info,
                    "payout_override",
                    "admin",
                    format!("payout {payout_id} override to {status}"),
                )
                .with_context(json!({ "reason": reason, "result": applied })),
            )
            .await;
        Ok(applied)
    }

    /// Runs [`Reconciler::poll_once`] every `period` until the task is aborted.
    pub fn spawn_poller(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.poll_once(Utc::now()).await {
                    Ok(report) if report.batches > 0 => info!(?report, "payout reconciliation pass"),
                    Ok(_) => debug!("no processing payouts"),
                    Err(e) => error!(error = %e, "payout reconciliation pass failed"),
                }
            }
        })
    }
}

/// The processor item for `payout`, matched on our sender item id first and
/// then on the processor's item id.
fn outcome_in_batch(status: &BatchStatus, payout: &Payout) -> RemoteOutcome {
    let sender_item_id = payout.sender_item_id();
    let item = status.items.iter().find(|item| {
        item.sender_item_id.as_deref() == Some(sender_item_id.as_str())
            || payout.item_id.as_deref() == Some(item.item_id.as_str())
    });
    match item {
        Some(item) => remote_outcome(
            item.status,
            Some(item.item_id.clone()),
            item.failure_reason.clone(),
            &item.raw_status,
        ),
        None if status.batch_status.eq_ignore_ascii_case("DENIED") => RemoteOutcome::Failed {
            item_id: None,
            reason: "batch denied".to_string(),
        },
        None => RemoteOutcome::InFlight,
    }
}

fn remote_outcome(
    status: RemoteItemStatus,
    item_id: Option<String>,
    failure_reason: Option<String>,
    raw_status: &str,
) -> RemoteOutcome {
    match status {
        RemoteItemStatus::Succeeded => RemoteOutcome::Succeeded { item_id },
        RemoteItemStatus::Failed => RemoteOutcome::Failed {
            item_id,
            reason: failure_reason.unwrap_or_else(|| format!("item {}", raw_status.to_ascii_lowercase())),
        },
        RemoteItemStatus::InFlight => RemoteOutcome::InFlight,
    }
}

/// `PAYMENT.PAYOUTS-ITEM.SUCCEEDED` -> `SUCCEEDED`.
fn event_suffix(event_type: &str) -> &str {
    event_type.rsplit('.').next().unwrap_or(event_type)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::processor::RemoteItem;
    use crate::types::PayoutMethod;

    fn payout(status: PayoutStatus) -> Payout {
        Payout {
            id: Uuid::new_v4(),
            affiliate_id: Uuid::new_v4(),
            amount: Decimal::new(5000, 2),
            method: PayoutMethod::Paypal,
            status,
            batch_id: Some("B-1".into()),
            item_id: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn terminal_payouts_never_move() {
        let now = Utc::now();
        for status in [PayoutStatus::Completed, PayoutStatus::Failed] {
            let p = payout(status);
            let success = RemoteOutcome::Succeeded { item_id: Some("I-1".into()) };
            let failure = RemoteOutcome::Failed {
                item_id: None,
                reason: "x".into(),
            };
            assert_eq!(apply_terminal_status(&p, &success, now), Transition::NoOp);
            assert_eq!(apply_terminal_status(&p, &failure, now), Transition::NoOp);
        }
    }

    #[test]
    fn success_completes_and_records_item() {
        let now = Utc::now();
        let p = payout(PayoutStatus::Processing);
        let Transition::Complete(done) =
            apply_terminal_status(&p, &RemoteOutcome::Succeeded { item_id: Some("I-9".into()) }, now)
        else {
            panic!("expected completion");
        };
        assert_eq!(done.status, PayoutStatus::Completed);
        assert_eq!(done.item_id.as_deref(), Some("I-9"));
        assert_eq!(done.completed_at, Some(now));
        assert_eq!(done.amount, p.amount);
    }

    #[test]
    fn in_flight_is_a_noop() {
        let p = payout(PayoutStatus::Processing);
        assert_eq!(
            apply_terminal_status(&p, &RemoteOutcome::InFlight, Utc::now()),
            Transition::NoOp
        );
    }

    #[test]
    fn batch_items_match_on_sender_item_id() {
        let p = payout(PayoutStatus::Processing);
        let status = BatchStatus {
            batch_id: "B-1".into(),
            batch_status: "SUCCESS".into(),
            items: vec![
                RemoteItem {
                    item_id: "I-other".into(),
                    sender_item_id: Some(Uuid::new_v4().to_string()),
                    status: RemoteItemStatus::Failed,
                    raw_status: "FAILED".into(),
                    failure_reason: None,
                },
                RemoteItem {
                    item_id: "I-mine".into(),
                    sender_item_id: Some(p.sender_item_id()),
                    status: RemoteItemStatus::Succeeded,
                    raw_status: "SUCCESS".into(),
                    failure_reason: None,
                },
            ],
        };
        assert_eq!(
            outcome_in_batch(&status, &p),
            RemoteOutcome::Succeeded {
                item_id: Some("I-mine".into())
            }
        );
    }

    #[test]
    fn denied_batch_fails_unmatched_payouts() {
        let p = payout(PayoutStatus::Processing);
        let status = BatchStatus {
            batch_id: "B-1".into(),
            batch_status: "DENIED".into(),
            items: Vec::new(),
        };
        assert!(matches!(outcome_in_batch(&status, &p), RemoteOutcome::Failed { .. }));
    }

    #[test]
    fn event_suffixes() {
        assert_eq!(event_suffix("PAYMENT.PAYOUTS-ITEM.SUCCEEDED"), "SUCCEEDED");
        assert_eq!(event_suffix("PAYMENT.PAYOUTSBATCH.DENIED"), "DENIED");
    }
}
