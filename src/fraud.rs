//! Fraud heuristics.
//!
//! Scoring is split from data gathering: [`score_referral`] and
//! [`score_application`] are pure functions over a snapshot of ledger counts,
//! and the `*_signals` functions build those snapshots from a [`LedgerStore`]
//! at an explicit `now`. A flag never blocks anything; it only produces an
//! entry in the review queue.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::ledger::{LedgerResult, LedgerStore};

/// Scores at or above this are flagged.
pub const FLAG_THRESHOLD: u32 = 30;

pub const VELOCITY_MIN_REFERRALS: i64 = 10;
/// Counted over every referral in the ledger, not per code.
pub const CODE_VOLUME_MIN_USES: i64 = 20;
pub const SPIKE_MIN_DAILY: i64 = 5;
pub const SPIKE_BASELINE_DAYS: i64 = 30;
pub const HIGH_ORDER_TOTAL: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);
pub const LOW_ORDER_TOTAL: Decimal = Decimal::from_parts(10, 0, 0, false, 0);
pub const SIMILAR_EMAIL_MANY: usize = 3;
pub const SHARED_IP_MANY: i64 = 3;
pub const SHARED_IP_WINDOW_DAYS: i64 = 7;

/// A heuristic that fired, with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum FraudSignal {
    ReferralVelocity { last_hour: i64 },
    DiscountCodeVolume { last_day: i64 },
    ActivitySpike { last_day: i64, last_30_days: i64 },
    HighOrderTotal { total: Decimal },
    LowOrderTotal { total: Decimal },
    SimilarEmails { matches: usize },
    SharedIp { affiliates: i64 },
}

impl FraudSignal {
    pub fn points(&self) -> u32 {
        match self {
            Self::ReferralVelocity { .. } => 30,
            Self::DiscountCodeVolume { .. } => 20,
            Self::ActivitySpike { .. } => 25,
            Self::HighOrderTotal { .. } => 10,
            Self::LowOrderTotal { .. } => 15,
            Self::SimilarEmails { matches } if *matches >= SIMILAR_EMAIL_MANY => 40,
            Self::SimilarEmails { .. } => 15,
            Self::SharedIp { affiliates } if *affiliates >= SHARED_IP_MANY => 35,
            Self::SharedIp { .. } => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FraudReport {
    pub score: u32,
    pub flagged: bool,
    pub signals: Vec<FraudSignal>,
}

impl FraudReport {
    fn from_signals(signals: Vec<FraudSignal>) -> Self {
        let score = signals.iter().map(FraudSignal::points).sum();
        Self {
            score,
            flagged: score >= FLAG_THRESHOLD,
            signals,
        }
    }
}

/// Ledger counts relevant to a new referral, excluding the referral itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralSignals {
    pub affiliate_last_hour: i64,
    pub affiliate_last_day: i64,
    pub affiliate_last_30_days: i64,
    pub global_last_day: i64,
    pub order_total: Decimal,
}

pub fn score_referral(s: &ReferralSignals) -> FraudReport {
    let mut signals = Vec::new();

    if s.affiliate_last_hour >= VELOCITY_MIN_REFERRALS {
        signals.push(FraudSignal::ReferralVelocity {
            last_hour: s.affiliate_last_hour,
        });
    }
    if s.global_last_day >= CODE_VOLUME_MIN_USES {
        signals.push(FraudSignal::DiscountCodeVolume {
            last_day: s.global_last_day,
        });
    }
    // An average below one per day over the baseline window.
    let quiet_baseline = s.affiliate_last_30_days < SPIKE_BASELINE_DAYS;
    if quiet_baseline && s.affiliate_last_day >= SPIKE_MIN_DAILY {
        signals.push(FraudSignal::ActivitySpike {
            last_day: s.affiliate_last_day,
            last_30_days: s.affiliate_last_30_days,
        });
    }
    if s.order_total > HIGH_ORDER_TOTAL {
        signals.push(FraudSignal::HighOrderTotal { total: s.order_total });
    } else if s.order_total < LOW_ORDER_TOTAL {
        signals.push(FraudSignal::LowOrderTotal { total: s.order_total });
    }

    FraudReport::from_signals(signals)
}

pub async fn referral_signals(
    ledger: &dyn LedgerStore,
    affiliate_id: Uuid,
    order_total: Decimal,
    now: DateTime<Utc>,
) -> LedgerResult<ReferralSignals> {
    let affiliate = Some(affiliate_id);
    Ok(ReferralSignals {
        affiliate_last_hour: ledger
            .count_referrals_since(affiliate, now - Duration::hours(1))
            .await?,
        affiliate_last_day: ledger
            .count_referrals_since(affiliate, now - Duration::hours(24))
            .await?,
        affiliate_last_30_days: ledger
            .count_referrals_since(affiliate, now - Duration::days(SPIKE_BASELINE_DAYS))
            .await?,
        global_last_day: ledger
            .count_referrals_since(None, now - Duration::hours(24))
            .await?,
        order_total,
    })
}

/// Canonical form of an email for similarity checks: lower-cased, `+tag`
/// dropped, and dots, underscores and hyphens removed from the local part.
pub fn normalize_email(email: &str) -> String {
    let email = email.trim().to_lowercase();
    let Some((local, domain)) = email.rsplit_once('@') else {
        return email;
    };
    let local = local.split('+').next().unwrap_or(local);
    let local: String = local
        .chars()
        .filter(|c| !matches!(c, '.' | '_' | '-'))
        .collect();
    format!("{local}@{domain}")
}

pub fn count_similar_emails(candidate: &str, existing: &[String]) -> usize {
    let needle = normalize_email(candidate);
    existing
        .iter()
        .filter(|e| normalize_email(e) == needle)
        .count()
}

/// Counts relevant to a new affiliate application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationSignals {
    pub similar_emails: usize,
    /// Other affiliates that signed up from the same IP in the trailing window.
    pub affiliates_sharing_ip: i64,
}

pub fn score_application(s: &ApplicationSignals) -> FraudReport {
    let mut signals = Vec::new();
    if s.similar_emails > 0 {
        signals.push(FraudSignal::SimilarEmails {
            matches: s.similar_emails,
        });
    }
    if s.affiliates_sharing_ip > 0 {
        signals.push(FraudSignal::SharedIp {
            affiliates: s.affiliates_sharing_ip,
        });
    }
    FraudReport::from_signals(signals)
}

pub async fn application_signals(
    ledger: &dyn LedgerStore,
    email: &str,
    ip: Option<&str>,
    now: DateTime<Utc>,
) -> LedgerResult<ApplicationSignals> {
    let existing = ledger.list_affiliate_emails().await?;
    let affiliates_sharing_ip = match ip {
        Some(ip) => {
            ledger
                .count_affiliates_sharing_ip(ip, now - Duration::days(SHARED_IP_WINDOW_DAYS))
                .await?
        }
        None => 0,
    };
    Ok(ApplicationSignals {
        similar_emails: count_similar_emails(email, &existing),
        affiliates_sharing_ip,
    })
}
