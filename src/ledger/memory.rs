use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerError, LedgerResult, LedgerStore};
use crate::types::{
    Affiliate, AffiliateStats, AffiliateStatus, Payout, PayoutStatus, ReferredCustomer, Referral,
    ReferralStatus, ReviewItem, SystemError, Tier,
};

#[derive(Default)]
struct State {
    tiers: Vec<Tier>,
    affiliates: Vec<Affiliate>,
    signups: Vec<(Uuid, String, DateTime<Utc>)>,
    customers: Vec<ReferredCustomer>,
    referrals: Vec<Referral>,
    payouts: Vec<Payout>,
    review_items: Vec<ReviewItem>,
    system_errors: Vec<SystemError>,
    fail_payout_inserts: bool,
    fail_batch_attach: bool,
    fail_payout_completion: bool,
}

/// Ledger held in process memory, enforcing the same uniqueness rules as the
/// Postgres schema. Used by the test-suite and for running without a database.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tiers(tiers: Vec<Tier>) -> Self {
        Self {
            state: Mutex::new(State {
                tiers,
                ..State::default()
            }),
        }
    }

    /// Makes every later `insert_payout` fail, as a lost database would.
    pub async fn fail_payout_inserts(&self, fail: bool) {
        self.state.lock().await.fail_payout_inserts = fail;
    }

    pub async fn fail_batch_attach(&self, fail: bool) {
        self.state.lock().await.fail_batch_attach = fail;
    }

    /// Makes `complete_payout` fail before writing anything.
    pub async fn fail_payout_completion(&self, fail: bool) {
        self.state.lock().await.fail_payout_completion = fail;
    }

    pub async fn system_errors(&self) -> Vec<SystemError> {
        self.state.lock().await.system_errors.clone()
    }

    pub async fn referrals(&self) -> Vec<Referral> {
        self.state.lock().await.referrals.clone()
    }

    pub async fn customers(&self) -> Vec<ReferredCustomer> {
        self.state.lock().await.customers.clone()
    }

    pub async fn payouts(&self) -> Vec<Payout> {
        self.state.lock().await.payouts.clone()
    }
}

fn affiliate_mut(state: &mut State, id: Uuid) -> LedgerResult<&mut Affiliate> {
    state
        .affiliates
        .iter_mut()
        .find(|a| a.id == id)
        .ok_or_else(|| LedgerError::not_found("affiliate", id))
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn list_tiers(&self) -> LedgerResult<Vec<Tier>> {
        let mut tiers = self.state.lock().await.tiers.clone();
        tiers.sort_by_key(|t| t.sort_order);
        Ok(tiers)
    }

    async fn insert_affiliate(&self, affiliate: &Affiliate) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let taken = state.affiliates.iter().any(|a| {
            a.auth_subject == affiliate.auth_subject
                || a.referral_code.eq_ignore_ascii_case(&affiliate.referral_code)
        });
        if taken {
            return Err(LedgerError::Conflict(format!(
                "affiliate subject or code already registered: {}",
                affiliate.referral_code
            )));
        }
        state.affiliates.push(affiliate.clone());
        Ok(())
    }

    async fn find_affiliate(&self, id: Uuid) -> LedgerResult<Option<Affiliate>> {
        let state = self.state.lock().await;
        Ok(state.affiliates.iter().find(|a| a.id == id).cloned())
    }

    async fn find_affiliate_by_subject(&self, subject: &str) -> LedgerResult<Option<Affiliate>> {
        let state = self.state.lock().await;
        Ok(state
            .affiliates
            .iter()
            .find(|a| a.auth_subject == subject)
            .cloned())
    }

    async fn find_approved_affiliate_by_code(&self, code: &str) -> LedgerResult<Option<Affiliate>> {
        let state = self.state.lock().await;
        Ok(state
            .affiliates
            .iter()
            .find(|a| a.status == AffiliateStatus::Approved && a.matches_code(code))
            .cloned())
    }

    async fn list_affiliate_emails(&self) -> LedgerResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.affiliates.iter().map(|a| a.email.clone()).collect())
    }

    async fn set_affiliate_status(
        &self,
        id: Uuid,
        status: AffiliateStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let affiliate = affiliate_mut(&mut state, id)?;
        affiliate.status = status;
        affiliate.updated_at = now;
        Ok(())
    }

    async fn set_discount_code(&self, id: Uuid, code: &str, now: DateTime<Utc>) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let affiliate = affiliate_mut(&mut state, id)?;
        affiliate.discount_code = Some(code.to_string());
        affiliate.updated_at = now;
        Ok(())
    }

    async fn update_affiliate_tier(
        &self,
        id: Uuid,
        expected: &str,
        tier: &Tier,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let affiliate = affiliate_mut(&mut state, id)?;
        if affiliate.tier != expected {
            return Ok(false);
        }
        affiliate.tier = tier.slug.clone();
        affiliate.commission_rate = tier.commission_rate;
        affiliate.updated_at = now;
        Ok(true)
    }

    async fn update_affiliate_stats(
        &self,
        id: Uuid,
        stats: &AffiliateStats,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let affiliate = affiliate_mut(&mut state, id)?;
        affiliate.stats = stats.clone();
        affiliate.updated_at = now;
        Ok(())
    }

    async fn record_signup(&self, affiliate_id: Uuid, ip: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.signups.push((affiliate_id, ip.to_string(), at));
        Ok(())
    }

    async fn count_affiliates_sharing_ip(&self, ip: &str, since: DateTime<Utc>) -> LedgerResult<i64> {
        let state = self.state.lock().await;
        let distinct: HashSet<Uuid> = state
            .signups
            .iter()
            .filter(|(_, signup_ip, at)| signup_ip == ip && *at >= since)
            .map(|(id, _, _)| *id)
            .collect();
        Ok(distinct.len() as i64)
    }

    async fn find_customer_by_storefront_id(&self, id: &str) -> LedgerResult<Option<ReferredCustomer>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .iter()
            .find(|c| c.storefront_customer_id.as_deref() == Some(id))
            .cloned())
    }

    async fn find_customer_by_billing_id(&self, id: &str) -> LedgerResult<Option<ReferredCustomer>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .iter()
            .find(|c| c.billing_customer_id.as_deref() == Some(id))
            .cloned())
    }

    async fn find_customer_by_email(&self, email: &str) -> LedgerResult<Option<ReferredCustomer>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .iter()
            .find(|c| {
                c.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn insert_customer(&self, customer: &ReferredCustomer) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let clash = state.customers.iter().any(|c| {
            (customer.storefront_customer_id.is_some()
                && c.storefront_customer_id == customer.storefront_customer_id)
                || (customer.billing_customer_id.is_some()
                    && c.billing_customer_id == customer.billing_customer_id)
        });
        if clash {
            return Err(LedgerError::Conflict("customer already attributed".into()));
        }
        state.customers.push(customer.clone());
        Ok(())
    }

    async fn update_customer_keys(&self, customer: &ReferredCustomer) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let clash = state.customers.iter().filter(|c| c.id != customer.id).any(|c| {
            (customer.storefront_customer_id.is_some()
                && c.storefront_customer_id == customer.storefront_customer_id)
                || (customer.billing_customer_id.is_some()
                    && c.billing_customer_id == customer.billing_customer_id)
        });
        if clash {
            return Err(LedgerError::Conflict("customer key belongs to another customer".into()));
        }
        let row = state
            .customers
            .iter_mut()
            .find(|c| c.id == customer.id)
            .ok_or_else(|| LedgerError::not_found("customer", customer.id))?;
        row.storefront_customer_id = customer.storefront_customer_id.clone();
        row.billing_customer_id = customer.billing_customer_id.clone();
        row.email = customer.email.clone();
        Ok(())
    }

    async fn insert_referral(&self, referral: &Referral) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if state.referrals.iter().any(|r| r.order_id == referral.order_id) {
            return Err(LedgerError::DuplicateOrder(referral.order_id.clone()));
        }
        state.referrals.push(referral.clone());
        Ok(())
    }

    async fn find_referral(&self, id: Uuid) -> LedgerResult<Option<Referral>> {
        let state = self.state.lock().await;
        Ok(state.referrals.iter().find(|r| r.id == id).cloned())
    }

    async fn find_referral_by_order(&self, order_id: &str) -> LedgerResult<Option<Referral>> {
        let state = self.state.lock().await;
        Ok(state
            .referrals
            .iter()
            .find(|r| r.order_id == order_id)
            .cloned())
    }

    async fn set_referral_status(
        &self,
        id: Uuid,
        from: ReferralStatus,
        to: ReferralStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let referral = state
            .referrals
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LedgerError::not_found("referral", id))?;
        if referral.status != from {
            return Ok(false);
        }
        referral.status = to;
        referral.updated_at = now;
        Ok(true)
    }

    async fn list_referrals_for_affiliate(&self, affiliate_id: Uuid) -> LedgerResult<Vec<Referral>> {
        let state = self.state.lock().await;
        Ok(state
            .referrals
            .iter()
            .filter(|r| r.affiliate_id == affiliate_id)
            .cloned()
            .collect())
    }

    async fn count_referrals_since(
        &self,
        affiliate_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> LedgerResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .referrals
            .iter()
            .filter(|r| r.created_at >= since)
            .filter(|r| affiliate_id.is_none_or(|id| r.affiliate_id == id))
            .count() as i64)
    }

    async fn insert_payout(&self, payout: &Payout) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_payout_inserts {
            return Err(LedgerError::Database(sqlx::Error::PoolTimedOut));
        }
        let in_flight = !payout.status.is_terminal()
            && state
                .payouts
                .iter()
                .any(|p| p.affiliate_id == payout.affiliate_id && !p.status.is_terminal());
        if in_flight {
            return Err(LedgerError::PayoutInFlight(payout.affiliate_id));
        }
        state.payouts.push(payout.clone());
        Ok(())
    }

    async fn attach_batch(&self, payout_ids: &[Uuid], batch_id: &str) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_batch_attach {
            return Err(LedgerError::Database(sqlx::Error::PoolTimedOut));
        }
        for payout in state.payouts.iter_mut().filter(|p| payout_ids.contains(&p.id)) {
            payout.batch_id = Some(batch_id.to_string());
        }
        Ok(())
    }

    async fn find_payout(&self, id: Uuid) -> LedgerResult<Option<Payout>> {
        let state = self.state.lock().await;
        Ok(state.payouts.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payout_by_item_id(&self, item_id: &str) -> LedgerResult<Option<Payout>> {
        let state = self.state.lock().await;
        Ok(state
            .payouts
            .iter()
            .find(|p| p.item_id.as_deref() == Some(item_id))
            .cloned())
    }

    async fn list_payouts_for_affiliate(&self, affiliate_id: Uuid) -> LedgerResult<Vec<Payout>> {
        let state = self.state.lock().await;
        Ok(state
            .payouts
            .iter()
            .filter(|p| p.affiliate_id == affiliate_id)
            .cloned()
            .collect())
    }

    async fn list_processing_payouts(&self) -> LedgerResult<Vec<Payout>> {
        let state = self.state.lock().await;
        Ok(state
            .payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Processing && p.batch_id.is_some())
            .cloned()
            .collect())
    }

    async fn has_open_payout(&self, affiliate_id: Uuid) -> LedgerResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .payouts
            .iter()
            .any(|p| p.affiliate_id == affiliate_id && !p.status.is_terminal()))
    }

    async fn transition_payout(&self, updated: &Payout, from: &[PayoutStatus]) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let payout = state
            .payouts
            .iter_mut()
            .find(|p| p.id == updated.id)
            .ok_or_else(|| LedgerError::not_found("payout", updated.id))?;
        if !from.contains(&payout.status) {
            return Ok(false);
        }
        payout.status = updated.status;
        payout.item_id = updated.item_id.clone();
        payout.failure_reason = updated.failure_reason.clone();
        payout.completed_at = updated.completed_at;
        Ok(true)
    }

    async fn complete_payout(
        &self,
        updated: &Payout,
        from: &[PayoutStatus],
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<u64>> {
        let mut state = self.state.lock().await;
        if state.fail_payout_completion {
            return Err(LedgerError::Database(sqlx::Error::PoolTimedOut));
        }
        let payout = state
            .payouts
            .iter_mut()
            .find(|p| p.id == updated.id)
            .ok_or_else(|| LedgerError::not_found("payout", updated.id))?;
        if !from.contains(&payout.status) {
            return Ok(None);
        }
        payout.status = updated.status;
        payout.item_id = updated.item_id.clone();
        payout.failure_reason = updated.failure_reason.clone();
        payout.completed_at = updated.completed_at;

        let mut paid = 0;
        for referral in state
            .referrals
            .iter_mut()
            .filter(|r| r.affiliate_id == updated.affiliate_id && r.status == ReferralStatus::Approved)
        {
            referral.status = ReferralStatus::Paid;
            referral.payout_id = Some(updated.id);
            referral.updated_at = now;
            paid += 1;
        }
        Ok(Some(paid))
    }

    async fn insert_review_item(&self, item: &ReviewItem) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let duplicate = item.order_id.is_some()
            && state
                .review_items
                .iter()
                .any(|i| !i.resolved && i.kind == item.kind && i.order_id == item.order_id);
        if duplicate {
            return Ok(false);
        }
        state.review_items.push(item.clone());
        Ok(true)
    }

    async fn list_open_review_items(&self) -> LedgerResult<Vec<ReviewItem>> {
        let state = self.state.lock().await;
        Ok(state
            .review_items
            .iter()
            .filter(|i| !i.resolved)
            .cloned()
            .collect())
    }

    async fn resolve_review_item(&self, id: Uuid) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        match state
            .review_items
            .iter_mut()
            .find(|i| i.id == id && !i.resolved)
        {
            Some(item) => {
                item.resolved = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_system_error(&self, error: &SystemError) -> LedgerResult<()> {
        self.state.lock().await.system_errors.push(error.clone());
        Ok(())
    }
}
