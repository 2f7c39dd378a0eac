//! Affiliate aggregates, always re-derived from the raw referral and payout
//! rows rather than maintained as running counters. Concurrent recalculations
//! therefore converge on the same values whatever order they run in.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::commission::{TierChange, evaluate_tier};
use crate::ledger::{LedgerError, LedgerResult, LedgerStore};
use crate::notify::{EventName, Notification, Notifier, notify_best_effort};
use crate::types::{AffiliateStats, Payout, PayoutStatus, Referral};

/// `balance_owed` is earned commission (approved + paid referrals) minus
/// completed payouts. It is floored at zero; a negative raw value means a
/// payout exceeded earnings and is logged for review.
pub fn derive_stats(referrals: &[Referral], payouts: &[Payout]) -> AffiliateStats {
    let countable = referrals.iter().filter(|r| r.status.is_countable());
    let total_referrals = countable.clone().count() as i64;
    let total_revenue: Decimal = countable.map(|r| r.order_total).sum();

    let total_commission_earned: Decimal = referrals
        .iter()
        .filter(|r| r.status.is_earned())
        .map(|r| r.commission_amount)
        .sum();
    let total_commission_paid: Decimal = payouts
        .iter()
        .filter(|p| p.status == PayoutStatus::Completed)
        .map(|p| p.amount)
        .sum();

    let raw_balance = total_commission_earned - total_commission_paid;
    if raw_balance.is_sign_negative() && !raw_balance.is_zero() {
        warn!(%raw_balance, "completed payouts exceed earned commission");
    }

    AffiliateStats {
        total_referrals,
        total_revenue,
        total_commission_earned,
        total_commission_paid,
        balance_owed: raw_balance.max(Decimal::ZERO),
    }
}

/// Derives an affiliate's stats from the ledger without writing anything.
pub async fn current_stats(ledger: &dyn LedgerStore, affiliate_id: Uuid) -> LedgerResult<AffiliateStats> {
    let referrals = ledger.list_referrals_for_affiliate(affiliate_id).await?;
    let payouts = ledger.list_payouts_for_affiliate(affiliate_id).await?;
    Ok(derive_stats(&referrals, &payouts))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recalculation {
    pub stats: AffiliateStats,
    /// Set only on the call that actually moved the affiliate to a new tier.
    pub tier_change: Option<TierChange>,
}

#[derive(Clone)]
pub struct StatsRecalculator {
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
}

impl StatsRecalculator {
    pub fn new(ledger: Arc<dyn LedgerStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { ledger, notifier }
    }

    /// Recomputes and stores the affiliate's aggregates, then evaluates their
    /// tier. A tier move updates tier and commission rate together and emits
    /// one `tier_upgraded` notification.
    pub async fn recalculate(&self, affiliate_id: Uuid, now: DateTime<Utc>) -> LedgerResult<Recalculation> {
        let affiliate = self
            .ledger
            .find_affiliate(affiliate_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("affiliate", affiliate_id))?;

        let stats = current_stats(self.ledger.as_ref(), affiliate_id).await?;
        self.ledger
            .update_affiliate_stats(affiliate_id, &stats, now)
            .await?;

        let tiers = self.ledger.list_tiers().await?;
        let Some(change) = evaluate_tier(&affiliate.tier, &tiers, stats.total_referrals) else {
            return Ok(Recalculation {
                stats,
                tier_change: None,
            });
        };

        let moved = self
            .ledger
            .update_affiliate_tier(affiliate_id, &change.from, &change.to, now)
            .await?;
        if !moved {
            return Ok(Recalculation {
                stats,
                tier_change: None,
            });
        }

        info!(
            affiliate_id = %affiliate_id,
            from = %change.from,
            to = %change.to.slug,
            rate = %change.to.commission_rate,
            "affiliate tier upgraded"
        );
        notify_best_effort(
            self.notifier.as_ref(),
            Notification::new(
                EventName::TierUpgraded,
                &affiliate.email,
                json!({
                    "previous_tier": change.from,
                    "tier": change.to.slug,
                    "tier_name": change.to.name,
                    "commission_rate": change.to.commission_rate,
                    "perks": change.to.perks,
                    "total_referrals": stats.total_referrals,
                }),
            )
            .external_id(affiliate.auth_subject.clone()),
        )
        .await;

        Ok(Recalculation {
            stats,
            tier_change: Some(change),
        })
    }
}
