//! Persistent ledger of affiliates, referrals, payouts and customer attribution.
//!
//! The store enforces the constraints everything else relies on: `order_id` is
//! unique across referrals, an affiliate has at most one open payout, and
//! status changes that race are compare-and-set.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{
    Affiliate, AffiliateStats, AffiliateStatus, Payout, PayoutStatus, ReferredCustomer, Referral,
    ReferralStatus, ReviewItem, SystemError, Tier, UnknownVariant,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A referral for this external order already exists. Benign under redelivery.
    #[error("referral for order {0} already recorded")]
    DuplicateOrder(String),
    #[error("affiliate {0} already has an open payout")]
    PayoutInFlight(Uuid),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("corrupt row: {0}")]
    Corrupt(#[from] UnknownVariant),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn list_tiers(&self) -> LedgerResult<Vec<Tier>>;

    /// Fails with `Conflict` when the subject or referral code is taken.
    async fn insert_affiliate(&self, affiliate: &Affiliate) -> LedgerResult<()>;
    async fn find_affiliate(&self, id: Uuid) -> LedgerResult<Option<Affiliate>>;
    async fn find_affiliate_by_subject(&self, subject: &str) -> LedgerResult<Option<Affiliate>>;
    /// Case-insensitive match on referral code or discount code, approved affiliates only.
    async fn find_approved_affiliate_by_code(&self, code: &str) -> LedgerResult<Option<Affiliate>>;
    async fn list_affiliate_emails(&self) -> LedgerResult<Vec<String>>;
    async fn set_affiliate_status(
        &self,
        id: Uuid,
        status: AffiliateStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<()>;
    async fn set_discount_code(&self, id: Uuid, code: &str, now: DateTime<Utc>) -> LedgerResult<()>;
    /// Moves the affiliate to `tier` only while their stored tier is still
    /// `expected`. Returns whether this call made the change.
    async fn update_affiliate_tier(
        &self,
        id: Uuid,
        expected: &str,
        tier: &Tier,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool>;
    async fn update_affiliate_stats(
        &self,
        id: Uuid,
        stats: &AffiliateStats,
        now: DateTime<Utc>,
    ) -> LedgerResult<()>;

    async fn record_signup(&self, affiliate_id: Uuid, ip: &str, at: DateTime<Utc>) -> LedgerResult<()>;
    /// Distinct affiliates that signed up from `ip` since `since`.
    async fn count_affiliates_sharing_ip(&self, ip: &str, since: DateTime<Utc>) -> LedgerResult<i64>;

    async fn find_customer_by_storefront_id(&self, id: &str) -> LedgerResult<Option<ReferredCustomer>>;
    async fn find_customer_by_billing_id(&self, id: &str) -> LedgerResult<Option<ReferredCustomer>>;
    async fn find_customer_by_email(&self, email: &str) -> LedgerResult<Option<ReferredCustomer>>;
    async fn insert_customer(&self, customer: &ReferredCustomer) -> LedgerResult<()>;
    /// Overwrites the three join keys of an existing row.
    async fn update_customer_keys(&self, customer: &ReferredCustomer) -> LedgerResult<()>;

    /// Fails with `DuplicateOrder` when the order id is already recorded.
    async fn insert_referral(&self, referral: &Referral) -> LedgerResult<()>;
    async fn find_referral(&self, id: Uuid) -> LedgerResult<Option<Referral>>;
    async fn find_referral_by_order(&self, order_id: &str) -> LedgerResult<Option<Referral>>;
    /// Compare-and-set on status. Returns whether the row was in `from`.
    async fn set_referral_status(
        &self,
        id: Uuid,
        from: ReferralStatus,
        to: ReferralStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool>;
    async fn list_referrals_for_affiliate(&self, affiliate_id: Uuid) -> LedgerResult<Vec<Referral>>;
    /// Referrals of any status created at or after `since`; all affiliates when `None`.
    async fn count_referrals_since(
        &self,
        affiliate_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> LedgerResult<i64>;

    /// Fails with [`LedgerError::PayoutInFlight`] while the affiliate has a
    /// non-terminal payout.
    async fn insert_payout(&self, payout: &Payout) -> LedgerResult<()>;
    /// Records the processor batch id on already reserved payouts.
    async fn attach_batch(&self, payout_ids: &[Uuid], batch_id: &str) -> LedgerResult<()>;
    async fn find_payout(&self, id: Uuid) -> LedgerResult<Option<Payout>>;
    async fn find_payout_by_item_id(&self, item_id: &str) -> LedgerResult<Option<Payout>>;
    async fn list_payouts_for_affiliate(&self, affiliate_id: Uuid) -> LedgerResult<Vec<Payout>>;
    /// Payouts in `processing` with a known batch id.
    async fn list_processing_payouts(&self) -> LedgerResult<Vec<Payout>>;
    async fn has_open_payout(&self, affiliate_id: Uuid) -> LedgerResult<bool>;
    /// Writes `updated` only while the stored status is one of `from`.
    async fn transition_payout(&self, updated: &Payout, from: &[PayoutStatus]) -> LedgerResult<bool>;
    /// Writes the completed `updated` payout and marks the affiliate's
    /// `approved` referrals `paid` by it, atomically. `None` when the stored
    /// status was not one of `from`; otherwise the number of referrals paid.
    async fn complete_payout(
        &self,
        updated: &Payout,
        from: &[PayoutStatus],
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<u64>>;

    /// `false` when an open item of the same kind already covers the order.
    async fn insert_review_item(&self, item: &ReviewItem) -> LedgerResult<bool>;
    async fn list_open_review_items(&self) -> LedgerResult<Vec<ReviewItem>>;
    async fn resolve_review_item(&self, id: Uuid) -> LedgerResult<bool>;

    async fn insert_system_error(&self, error: &SystemError) -> LedgerResult<()>;
}
