//! Commission arithmetic and tier evaluation.
//!
//! Everything here is pure: callers pass in the order amounts, rates and the
//! tier table, and persist the result themselves.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::types::Tier;

/// Currency precision for every persisted money value.
pub const CURRENCY_SCALE: u32 = 2;

/// Rounds to cents, half-up.
pub fn round_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Commission on an order. The base is the order subtotal (tax and shipping
/// excluded), never the total.
pub fn commission(order_subtotal: Decimal, rate: Decimal) -> Decimal {
    round_currency(order_subtotal * rate)
}

/// The highest tier whose `min_referrals` threshold is met.
pub fn effective_tier(tiers: &[Tier], total_referrals: i64) -> Option<&Tier> {
    tiers
        .iter()
        .filter(|t| t.min_referrals <= total_referrals)
        .max_by_key(|t| (t.sort_order, t.min_referrals))
}

/// The entry tier, used for new affiliates.
pub fn entry_tier(tiers: &[Tier]) -> Option<&Tier> {
    tiers.iter().min_by_key(|t| (t.sort_order, t.min_referrals))
}

/// An upward tier move detected by [`evaluate_tier`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierChange {
    pub from: String,
    pub to: Tier,
}

/// Compares the affiliate's stored tier against the one their referral count
/// earns. Only upward moves are reported: `total_referrals` is cumulative, so a
/// lower effective tier means the table changed, not the affiliate.
pub fn evaluate_tier(current_slug: &str, tiers: &[Tier], total_referrals: i64) -> Option<TierChange> {
    let target = effective_tier(tiers, total_referrals)?;
    if target.slug == current_slug {
        return None;
    }

    let current_rank = tiers
        .iter()
        .find(|t| t.slug == current_slug)
        .map(|t| (t.sort_order, t.min_referrals));

    match current_rank {
        Some(rank) if rank >= (target.sort_order, target.min_referrals) => None,
        _ => Some(TierChange {
            from: current_slug.to_string(),
            to: target.clone(),
        }),
    }
}
