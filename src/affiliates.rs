//! Affiliate lifecycle (application, approval, rejection), admin referral
//! transitions and the manual-review queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::commission::entry_tier;
use crate::diagnostics::DiagnosticSink;
use crate::fraud::{application_signals, score_application};
use crate::ledger::{LedgerError, LedgerStore};
use crate::notify::{EventName, Notification, Notifier, notify_best_effort};
use crate::settlement::{Recalculation, StatsRecalculator, current_stats};
use crate::storefront::{DiscountProvisioner, ProvisionError};
use crate::types::{
    Affiliate, AffiliateStatus, Referral, ReferralStatus, ReviewItem, ReviewKind, Severity, SystemError,
};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;
const CODE_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum AffiliateError {
    #[error("subject {0} has already applied")]
    AlreadyApplied(String),
    #[error("invalid application: {0}")]
    InvalidInput(String),
    #[error("cannot move {entity} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone)]
pub struct Application {
    pub auth_subject: String,
    pub email: String,
    pub payout_email: Option<String>,
    pub signup_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationResult {
    pub affiliate: Affiliate,
    /// Set when the application fraud check queued the affiliate for review.
    pub flagged: bool,
}

#[derive(Clone)]
pub struct AffiliateService {
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    provisioner: Arc<dyn DiscountProvisioner>,
    recalculator: StatsRecalculator,
    diagnostics: DiagnosticSink,
    customer_discount: Decimal,
}

impl AffiliateService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        provisioner: Arc<dyn DiscountProvisioner>,
        recalculator: StatsRecalculator,
        diagnostics: DiagnosticSink,
        customer_discount: Decimal,
    ) -> Self {
        Self {
            ledger,
            notifier,
            provisioner,
            recalculator,
            diagnostics,
            customer_discount,
        }
    }

    /// Creates a `pending` affiliate on the entry tier. A suspicious application
    /// is queued for review but still created.
    pub async fn apply(&self, application: &Application, now: DateTime<Utc>) -> Result<ApplicationResult, AffiliateError> {
        let email = application.email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(AffiliateError::InvalidInput("email address is required".into()));
        }
        if self
            .ledger
            .find_affiliate_by_subject(&application.auth_subject)
            .await?
            .is_some()
        {
            return Err(AffiliateError::AlreadyApplied(application.auth_subject.clone()));
        }

        let tiers = self.ledger.list_tiers().await?;
        let tier = entry_tier(&tiers).ok_or_else(|| LedgerError::not_found("tier", "entry"))?;

        let ip = application.signup_ip.as_deref().filter(|ip| !ip.is_empty());
        let signals = application_signals(self.ledger.as_ref(), &email, ip, now).await?;
        let report = score_application(&signals);

        // Only a destination matching the identity provider's email counts as verified.
        let payout_email = application
            .payout_email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| email.clone());
        let payout_email_verified = payout_email == email;

        let mut affiliate = Affiliate {
            id: Uuid::new_v4(),
            auth_subject: application.auth_subject.clone(),
            email,
            status: AffiliateStatus::Pending,
            tier: tier.slug.clone(),
            commission_rate: tier.commission_rate,
            referral_code: String::new(),
            discount_code: None,
            payout_email: Some(payout_email),
            payout_email_verified,
            stats: Default::default(),
            created_at: now,
            updated_at: now,
        };
        self.insert_with_fresh_code(&mut affiliate).await?;

        if let Some(ip) = ip {
            self.ledger.record_signup(affiliate.id, ip, now).await?;
        }

        info!(
            affiliate_id = %affiliate.id,
            referral_code = %affiliate.referral_code,
            fraud_score = report.score,
            "affiliate application received"
        );

        if report.flagged {
            let item = ReviewItem::new(ReviewKind::ApplicationFlag, json!(report), now)
                .affiliate(affiliate.id)
                .score(report.score);
            if let Err(e) = self.ledger.insert_review_item(&item).await {
                warn!(error = %e, affiliate_id = %affiliate.id, "failed to queue application for review");
            }
        }

        notify_best_effort(
            self.notifier.as_ref(),
            Notification::new(
                EventName::AffiliateSignup,
                &affiliate.email,
                json!({ "referral_code": affiliate.referral_code, "tier": affiliate.tier }),
            )
            .external_id(affiliate.auth_subject.clone()),
        )
        .await;

        Ok(ApplicationResult {
            affiliate,
            flagged: report.flagged,
        })
    }

    async fn insert_with_fresh_code(&self, affiliate: &mut Affiliate) -> Result<(), AffiliateError> {
        let mut last = None;
        for _ in 0..CODE_ATTEMPTS {
            affiliate.referral_code = generate_code();
            match self.ledger.insert_affiliate(affiliate).await {
                Ok(()) => return Ok(()),
                Err(LedgerError::Conflict(reason)) => {
                    // A concurrent application for the same subject also lands here.
                    if self
                        .ledger
                        .find_affiliate_by_subject(&affiliate.auth_subject)
                        .await?
                        .is_some()
                    {
                        return Err(AffiliateError::AlreadyApplied(affiliate.auth_subject.clone()));
                    }
                    last = Some(LedgerError::Conflict(reason));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last
            .unwrap_or_else(|| LedgerError::Conflict("could not allocate a referral code".into()))
            .into())
    }

    pub async fn find_by_subject(&self, subject: &str) -> Result<Affiliate, AffiliateError> {
        let mut affiliate = self
            .ledger
            .find_affiliate_by_subject(subject)
            .await?
            .ok_or_else(|| LedgerError::not_found("affiliate", subject))?;
        affiliate.stats = current_stats(self.ledger.as_ref(), affiliate.id).await?;
        Ok(affiliate)
    }

    async fn load(&self, id: Uuid) -> Result<Affiliate, AffiliateError> {
        Ok(self
            .ledger
            .find_affiliate(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("affiliate", id))?)
    }

    /// `pending -> approved`, then provisions the storefront discount code if
    /// the affiliate has none yet. Approving an approved affiliate only retries
    /// the provisioning.
    pub async fn approve(&self, id: Uuid, now: DateTime<Utc>) -> Result<Affiliate, AffiliateError> {
        let mut affiliate = self.load(id).await?;
        match affiliate.status {
            AffiliateStatus::Pending => {
                self.ledger
                    .set_affiliate_status(id, AffiliateStatus::Approved, now)
                    .await?;
                affiliate.status = AffiliateStatus::Approved;
                info!(affiliate_id = %id, "affiliate approved");
                notify_best_effort(
                    self.notifier.as_ref(),
                    Notification::new(
                        EventName::AffiliateApproved,
                        &affiliate.email,
                        json!({ "referral_code": affiliate.referral_code, "tier": affiliate.tier }),
                    )
                    .external_id(affiliate.auth_subject.clone()),
                )
                .await;
            }
            AffiliateStatus::Approved => {}
            other => return Err(transition("affiliate", other, AffiliateStatus::Approved)),
        }

        if affiliate.discount_code.is_none() {
            affiliate.discount_code = self.provision_discount(&affiliate, now).await;
        }
        Ok(affiliate)
    }

    async fn provision_discount(&self, affiliate: &Affiliate, now: DateTime<Utc>) -> Option<String> {
        let result = self
            .provisioner
            .create_discount_code(&affiliate.referral_code, self.customer_discount)
            .await;
        let code = match result {
            Ok(code) => code,
            Err(ProvisionError::NotConfigured) => {
                warn!(affiliate_id = %affiliate.id, "discount provisioning disabled");
                return None;
            }
            Err(e) => {
                self.diagnostics
                    .record(
                        SystemError::new(Severity::Warning, "discount_provision_failed", "affiliates", e.to_string())
                            .with_context(json!({
                                "affiliate_id": affiliate.id,
                                "referral_code": affiliate.referral_code,
                            })),
                    )
                    .await;
                return None;
            }
        };
        if let Err(e) = self.ledger.set_discount_code(affiliate.id, &code, now).await {
            self.diagnostics
                .record(
                    SystemError::new(Severity::Error, "discount_code_write_failed", "affiliates", e.to_string())
                        .with_context(json!({ "affiliate_id": affiliate.id, "discount_code": code })),
                )
                .await;
            return None;
        }
        Some(code)
    }

    pub async fn reject(&self, id: Uuid, now: DateTime<Utc>) -> Result<Affiliate, AffiliateError> {
        let mut affiliate = self.load(id).await?;
        if affiliate.status != AffiliateStatus::Pending {
            return Err(transition("affiliate", affiliate.status, AffiliateStatus::Rejected));
        }
        self.ledger
            .set_affiliate_status(id, AffiliateStatus::Rejected, now)
            .await?;
        affiliate.status = AffiliateStatus::Rejected;
        info!(affiliate_id = %id, "affiliate rejected");
        Ok(affiliate)
    }

    pub async fn recalculate(&self, id: Uuid, now: DateTime<Utc>) -> Result<Recalculation, AffiliateError> {
        Ok(self.recalculator.recalculate(id, now).await?)
    }

    pub async fn approve_referral(&self, id: Uuid, now: DateTime<Utc>) -> Result<Referral, AffiliateError> {
        self.move_referral(id, ReferralStatus::Approved, now).await
    }

    pub async fn reject_referral(&self, id: Uuid, now: DateTime<Utc>) -> Result<Referral, AffiliateError> {
        self.move_referral(id, ReferralStatus::Rejected, now).await
    }

    async fn move_referral(&self, id: Uuid, to: ReferralStatus, now: DateTime<Utc>) -> Result<Referral, AffiliateError> {
        let mut referral = self
            .ledger
            .find_referral(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("referral", id))?;
        if !referral.status.can_transition_to(to) {
            return Err(transition("referral", referral.status, to));
        }
        if !self.ledger.set_referral_status(id, referral.status, to, now).await? {
            return Err(LedgerError::Conflict(format!("referral {id} changed concurrently")).into());
        }
        info!(referral_id = %id, from = %referral.status, to = %to, "referral status changed");
        referral.status = to;
        referral.updated_at = now;

        if let Err(e) = self.recalculator.recalculate(referral.affiliate_id, now).await {
            self.diagnostics
                .record(
                    SystemError::new(Severity::Warning, "recalculation_failed", "affiliates", e.to_string())
                        .with_context(json!({ "referral_id": id, "affiliate_id": referral.affiliate_id })),
                )
                .await;
        }
        Ok(referral)
    }

    pub async fn review_queue(&self) -> Result<Vec<ReviewItem>, AffiliateError> {
        Ok(self.ledger.list_open_review_items().await?)
    }

    pub async fn resolve_review_item(&self, id: Uuid) -> Result<(), AffiliateError> {
        if self.ledger.resolve_review_item(id).await? {
            Ok(())
        } else {
            Err(LedgerError::not_found("review item", id).into())
        }
    }
}

fn transition(entity: &'static str, from: impl ToString, to: impl ToString) -> AffiliateError {
    AffiliateError::InvalidTransition {
        entity,
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Eight characters from an alphabet without look-alikes (no 0/O, 1/I).
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
