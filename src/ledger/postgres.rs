use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::{LedgerError, LedgerResult, LedgerStore};
use crate::types::{
    Affiliate, AffiliateStats, AffiliateStatus, Payout, PayoutStatus, ReferredCustomer, Referral,
    ReferralStatus, ReviewItem, SystemError, Tier,
};

const AFFILIATE_COLUMNS: &str = "id, auth_subject, email, status, tier, commission_rate, \
    referral_code, discount_code, payout_email, payout_email_verified, total_referrals, \
    total_revenue, total_commission_earned, total_commission_paid, balance_owed, \
    created_at, updated_at";

const CUSTOMER_COLUMNS: &str = "id, affiliate_id, storefront_customer_id, billing_customer_id, \
    email, first_order_id, created_at";

const REFERRAL_COLUMNS: &str = "id, affiliate_id, customer_id, order_id, order_source, \
    order_subtotal, order_total, commission_rate, commission_amount, status, is_recurring, \
    payout_id, discount_code, created_at, updated_at";

const PAYOUT_COLUMNS: &str = "id, affiliate_id, amount, method, status, batch_id, item_id, \
    failure_reason, created_at, completed_at";

/// SQLSTATE 23505, returning the violated constraint name.
fn unique_violation(e: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            return Some(db_err.constraint().unwrap_or_default().to_string());
        }
    }
    None
}

#[derive(sqlx::FromRow)]
struct TierRow {
    slug: String,
    name: String,
    min_referrals: i64,
    commission_rate: Decimal,
    perks: Vec<String>,
    sort_order: i32,
}

impl From<TierRow> for Tier {
    fn from(row: TierRow) -> Self {
        Tier {
            slug: row.slug,
            name: row.name,
            min_referrals: row.min_referrals,
            commission_rate: row.commission_rate,
            perks: row.perks,
            sort_order: row.sort_order,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AffiliateRow {
    id: Uuid,
    auth_subject: String,
    email: String,
    status: String,
    tier: String,
    commission_rate: Decimal,
    referral_code: String,
    discount_code: Option<String>,
    payout_email: Option<String>,
    payout_email_verified: bool,
    total_referrals: i64,
    total_revenue: Decimal,
    total_commission_earned: Decimal,
    total_commission_paid: Decimal,
    balance_owed: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AffiliateRow> for Affiliate {
    type Error = LedgerError;

    fn try_from(row: AffiliateRow) -> Result<Self, Self::Error> {
        Ok(Affiliate {
            id: row.id,
            auth_subject: row.auth_subject,
            email: row.email,
            status: row.status.parse()?,
            tier: row.tier,
            commission_rate: row.commission_rate,
            referral_code: row.referral_code,
            discount_code: row.discount_code,
            payout_email: row.payout_email,
            payout_email_verified: row.payout_email_verified,
            stats: AffiliateStats {
                total_referrals: row.total_referrals,
                total_revenue: row.total_revenue,
                total_commission_earned: row.total_commission_earned,
                total_commission_paid: row.total_commission_paid,
                balance_owed: row.balance_owed,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    id: Uuid,
    affiliate_id: Uuid,
    storefront_customer_id: Option<String>,
    billing_customer_id: Option<String>,
    email: Option<String>,
    first_order_id: String,
    created_at: DateTime<Utc>,
}

impl From<CustomerRow> for ReferredCustomer {
    fn from(row: CustomerRow) -> Self {
        ReferredCustomer {
            id: row.id,
            affiliate_id: row.affiliate_id,
            storefront_customer_id: row.storefront_customer_id,
            billing_customer_id: row.billing_customer_id,
            email: row.email,
            first_order_id: row.first_order_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReferralRow {
    id: Uuid,
    affiliate_id: Uuid,
    customer_id: Option<Uuid>,
    order_id: String,
    order_source: String,
    order_subtotal: Decimal,
    order_total: Decimal,
    commission_rate: Decimal,
    commission_amount: Decimal,
    status: String,
    is_recurring: bool,
    payout_id: Option<Uuid>,
    discount_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReferralRow> for Referral {
    type Error = LedgerError;

    fn try_from(row: ReferralRow) -> Result<Self, Self::Error> {
        Ok(Referral {
            id: row.id,
            affiliate_id: row.affiliate_id,
            customer_id: row.customer_id,
            order_id: row.order_id,
            order_source: row.order_source.parse()?,
            order_subtotal: row.order_subtotal,
            order_total: row.order_total,
            commission_rate: row.commission_rate,
            commission_amount: row.commission_amount,
            status: row.status.parse()?,
            is_recurring: row.is_recurring,
            payout_id: row.payout_id,
            discount_code: row.discount_code,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    affiliate_id: Uuid,
    amount: Decimal,
    method: String,
    status: String,
    batch_id: Option<String>,
    item_id: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PayoutRow> for Payout {
    type Error = LedgerError;

    fn try_from(row: PayoutRow) -> Result<Self, Self::Error> {
        Ok(Payout {
            id: row.id,
            affiliate_id: row.affiliate_id,
            amount: row.amount,
            method: row.method.parse()?,
            status: row.status.parse()?,
            batch_id: row.batch_id,
            item_id: row.item_id,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReviewRow {
    id: Uuid,
    kind: String,
    affiliate_id: Option<Uuid>,
    referral_id: Option<Uuid>,
    order_id: Option<String>,
    score: Option<i32>,
    details: serde_json::Value,
    resolved: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReviewRow> for ReviewItem {
    type Error = LedgerError;

    fn try_from(row: ReviewRow) -> Result<Self, Self::Error> {
        Ok(ReviewItem {
            id: row.id,
            kind: row.kind.parse()?,
            affiliate_id: row.affiliate_id,
            referral_id: row.referral_id,
            order_id: row.order_id,
            score: row.score,
            details: row.details,
            resolved: row.resolved,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> LedgerResult<Vec<T>>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Postgres-backed ledger.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_affiliate(&self, clause: &str, bind: &str) -> LedgerResult<Option<Affiliate>> {
        let sql = format!("SELECT {AFFILIATE_COLUMNS} FROM affiliates WHERE {clause} LIMIT 1");
        let row = sqlx::query_as::<_, AffiliateRow>(&sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Affiliate::try_from).transpose()
    }

    async fn fetch_customer(&self, clause: &str, bind: &str) -> LedgerResult<Option<ReferredCustomer>> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM referred_customers WHERE {clause} LIMIT 1");
        let row = sqlx::query_as::<_, CustomerRow>(&sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ReferredCustomer::from))
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn list_tiers(&self) -> LedgerResult<Vec<Tier>> {
        let rows = sqlx::query_as::<_, TierRow>(
            r#"SELECT slug, name, min_referrals, commission_rate, perks, sort_order
               FROM tiers ORDER BY sort_order"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Tier::from).collect())
    }

    async fn insert_affiliate(&self, a: &Affiliate) -> LedgerResult<()> {
        sqlx::query(
            r#"INSERT INTO affiliates (id, auth_subject, email, status, tier, commission_rate,
                 referral_code, discount_code, payout_email, payout_email_verified,
                 total_referrals, total_revenue, total_commission_earned, total_commission_paid,
                 balance_owed, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"#,
        )
        .bind(a.id)
        .bind(&a.auth_subject)
        .bind(&a.email)
        .bind(a.status.as_str())
        .bind(&a.tier)
        .bind(a.commission_rate)
        .bind(&a.referral_code)
        .bind(&a.discount_code)
        .bind(&a.payout_email)
        .bind(a.payout_email_verified)
        .bind(a.stats.total_referrals)
        .bind(a.stats.total_revenue)
        .bind(a.stats.total_commission_earned)
        .bind(a.stats.total_commission_paid)
        .bind(a.stats.balance_owed)
        .bind(a.created_at)
        .bind(a.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match unique_violation(&e) {
            Some(constraint) => LedgerError::Conflict(constraint),
            None => e.into(),
        })?;
        Ok(())
    }

    async fn find_affiliate(&self, id: Uuid) -> LedgerResult<Option<Affiliate>> {
        let sql = format!("SELECT {AFFILIATE_COLUMNS} FROM affiliates WHERE id = $1");
        let row = sqlx::query_as::<_, AffiliateRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Affiliate::try_from).transpose()
    }

    async fn find_affiliate_by_subject(&self, subject: &str) -> LedgerResult<Option<Affiliate>> {
        self.fetch_affiliate("auth_subject = $1", subject).await
    }

    async fn find_approved_affiliate_by_code(&self, code: &str) -> LedgerResult<Option<Affiliate>> {
        self.fetch_affiliate(
            "status = 'approved' AND (LOWER(referral_code) = LOWER($1) OR LOWER(discount_code) = LOWER($1))",
            code,
        )
        .await
    }

    async fn list_affiliate_emails(&self) -> LedgerResult<Vec<String>> {
        let emails = sqlx::query_scalar::<_, String>(r#"SELECT email FROM affiliates"#)
            .fetch_all(&self.pool)
            .await?;
        Ok(emails)
    }

    async fn set_affiliate_status(
        &self,
        id: Uuid,
        status: AffiliateStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let res = sqlx::query(r#"UPDATE affiliates SET status = $2, updated_at = $3 WHERE id = $1"#)
            .bind(id)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(LedgerError::not_found("affiliate", id));
        }
        Ok(())
    }

    async fn set_discount_code(&self, id: Uuid, code: &str, now: DateTime<Utc>) -> LedgerResult<()> {
        let res = sqlx::query(r#"UPDATE affiliates SET discount_code = $2, updated_at = $3 WHERE id = $1"#)
            .bind(id)
            .bind(code)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(LedgerError::not_found("affiliate", id));
        }
        Ok(())
    }

    async fn update_affiliate_tier(
        &self,
        id: Uuid,
        expected: &str,
        tier: &Tier,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let res = sqlx::query(
            r#"UPDATE affiliates SET tier = $3, commission_rate = $4, updated_at = $5
               WHERE id = $1 AND tier = $2"#,
        )
        .bind(id)
        .bind(expected)
        .bind(&tier.slug)
        .bind(tier.commission_rate)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn update_affiliate_stats(
        &self,
        id: Uuid,
        stats: &AffiliateStats,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let res = sqlx::query(
            r#"UPDATE affiliates SET total_referrals = $2, total_revenue = $3,
                 total_commission_earned = $4, total_commission_paid = $5, balance_owed = $6,
                 updated_at = $7
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(stats.total_referrals)
        .bind(stats.total_revenue)
        .bind(stats.total_commission_earned)
        .bind(stats.total_commission_paid)
        .bind(stats.balance_owed)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(LedgerError::not_found("affiliate", id));
        }
        Ok(())
    }

    async fn record_signup(&self, affiliate_id: Uuid, ip: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        sqlx::query(r#"INSERT INTO affiliate_signups (affiliate_id, ip, created_at) VALUES ($1, $2, $3)"#)
            .bind(affiliate_id)
            .bind(ip)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_affiliates_sharing_ip(&self, ip: &str, since: DateTime<Utc>) -> LedgerResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(DISTINCT affiliate_id) FROM affiliate_signups
               WHERE ip = $1 AND created_at >= $2"#,
        )
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn find_customer_by_storefront_id(&self, id: &str) -> LedgerResult<Option<ReferredCustomer>> {
        self.fetch_customer("storefront_customer_id = $1", id).await
    }

    async fn find_customer_by_billing_id(&self, id: &str) -> LedgerResult<Option<ReferredCustomer>> {
        self.fetch_customer("billing_customer_id = $1", id).await
    }

    async fn find_customer_by_email(&self, email: &str) -> LedgerResult<Option<ReferredCustomer>> {
        self.fetch_customer("LOWER(email) = LOWER($1)", email).await
    }

    async fn insert_customer(&self, c: &ReferredCustomer) -> LedgerResult<()> {
        sqlx::query(
            r#"INSERT INTO referred_customers (id, affiliate_id, storefront_customer_id,
                 billing_customer_id, email, first_order_id, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(c.id)
        .bind(c.affiliate_id)
        .bind(&c.storefront_customer_id)
        .bind(&c.billing_customer_id)
        .bind(&c.email)
        .bind(&c.first_order_id)
        .bind(c.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match unique_violation(&e) {
            Some(constraint) => LedgerError::Conflict(constraint),
            None => e.into(),
        })?;
        Ok(())
    }

    async fn update_customer_keys(&self, c: &ReferredCustomer) -> LedgerResult<()> {
        let res = sqlx::query(
            r#"UPDATE referred_customers
               SET storefront_customer_id = $2, billing_customer_id = $3, email = $4
               WHERE id = $1"#,
        )
        .bind(c.id)
        .bind(&c.storefront_customer_id)
        .bind(&c.billing_customer_id)
        .bind(&c.email)
        .execute(&self.pool)
        .await
        .map_err(|e| match unique_violation(&e) {
            Some(constraint) => LedgerError::Conflict(constraint),
            None => e.into(),
        })?;
        if res.rows_affected() == 0 {
            return Err(LedgerError::not_found("customer", c.id));
        }
        Ok(())
    }

    async fn insert_referral(&self, r: &Referral) -> LedgerResult<()> {
        sqlx::query(
            r#"INSERT INTO referrals (id, affiliate_id, customer_id, order_id, order_source,
                 order_subtotal, order_total, commission_rate, commission_amount, status,
                 is_recurring, payout_id, discount_code, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(r.id)
        .bind(r.affiliate_id)
        .bind(r.customer_id)
        .bind(&r.order_id)
        .bind(r.order_source.as_str())
        .bind(r.order_subtotal)
        .bind(r.order_total)
        .bind(r.commission_rate)
        .bind(r.commission_amount)
        .bind(r.status.as_str())
        .bind(r.is_recurring)
        .bind(r.payout_id)
        .bind(&r.discount_code)
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match unique_violation(&e).as_deref() {
            Some("referrals_order_id_key") => LedgerError::DuplicateOrder(r.order_id.clone()),
            Some(constraint) => LedgerError::Conflict(constraint.to_string()),
            None => e.into(),
        })?;
        Ok(())
    }

    async fn find_referral(&self, id: Uuid) -> LedgerResult<Option<Referral>> {
        let sql = format!("SELECT {REFERRAL_COLUMNS} FROM referrals WHERE id = $1");
        let row = sqlx::query_as::<_, ReferralRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Referral::try_from).transpose()
    }

    async fn find_referral_by_order(&self, order_id: &str) -> LedgerResult<Option<Referral>> {
        let sql = format!("SELECT {REFERRAL_COLUMNS} FROM referrals WHERE order_id = $1");
        let row = sqlx::query_as::<_, ReferralRow>(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Referral::try_from).transpose()
    }

    async fn set_referral_status(
        &self,
        id: Uuid,
        from: ReferralStatus,
        to: ReferralStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let res = sqlx::query(
            r#"UPDATE referrals SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2"#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn list_referrals_for_affiliate(&self, affiliate_id: Uuid) -> LedgerResult<Vec<Referral>> {
        let sql = format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE affiliate_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, ReferralRow>(&sql)
            .bind(affiliate_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn count_referrals_since(
        &self,
        affiliate_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> LedgerResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM referrals
               WHERE created_at >= $1 AND ($2::uuid IS NULL OR affiliate_id = $2)"#,
        )
        .bind(since)
        .bind(affiliate_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn insert_payout(&self, p: &Payout) -> LedgerResult<()> {
        sqlx::query(
            r#"INSERT INTO payouts (id, affiliate_id, amount, method, status, batch_id,
                 item_id, failure_reason, created_at, completed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(p.id)
        .bind(p.affiliate_id)
        .bind(p.amount)
        .bind(p.method.as_str())
        .bind(p.status.as_str())
        .bind(&p.batch_id)
        .bind(&p.item_id)
        .bind(&p.failure_reason)
        .bind(p.created_at)
        .bind(p.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match unique_violation(&e).as_deref() {
            Some("payouts_one_open_per_affiliate") => LedgerError::PayoutInFlight(p.affiliate_id),
            Some(constraint) => LedgerError::Conflict(constraint.to_string()),
            None => e.into(),
        })?;
        Ok(())
    }

    async fn attach_batch(&self, payout_ids: &[Uuid], batch_id: &str) -> LedgerResult<()> {
        sqlx::query(r#"UPDATE payouts SET batch_id = $2 WHERE id = ANY($1)"#)
            .bind(payout_ids)
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_payout(&self, id: Uuid) -> LedgerResult<Option<Payout>> {
        let sql = format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = $1");
        let row = sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Payout::try_from).transpose()
    }

    async fn find_payout_by_item_id(&self, item_id: &str) -> LedgerResult<Option<Payout>> {
        let sql = format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE item_id = $1 LIMIT 1");
        let row = sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Payout::try_from).transpose()
    }

    async fn list_payouts_for_affiliate(&self, affiliate_id: Uuid) -> LedgerResult<Vec<Payout>> {
        let sql = format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE affiliate_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(affiliate_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_processing_payouts(&self) -> LedgerResult<Vec<Payout>> {
        let sql = format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts
             WHERE status = 'processing' AND batch_id IS NOT NULL ORDER BY batch_id, created_at"
        );
        let rows = sqlx::query_as::<_, PayoutRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn has_open_payout(&self, affiliate_id: Uuid) -> LedgerResult<bool> {
        let open = sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS (SELECT 1 FROM payouts
               WHERE affiliate_id = $1 AND status IN ('pending', 'processing'))"#,
        )
        .bind(affiliate_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(open)
    }

    async fn transition_payout(&self, updated: &Payout, from: &[PayoutStatus]) -> LedgerResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let res = sqlx::query(
            r#"UPDATE payouts SET status = $2, item_id = COALESCE($3, item_id),
                 failure_reason = $4, completed_at = $5
               WHERE id = $1 AND status = ANY($6)"#,
        )
        .bind(updated.id)
        .bind(updated.status.as_str())
        .bind(&updated.item_id)
        .bind(&updated.failure_reason)
        .bind(updated.completed_at)
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn complete_payout(
        &self,
        updated: &Payout,
        from: &[PayoutStatus],
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<u64>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let mut tx = self.pool.begin().await?;
        let moved = sqlx::query(
            r#"UPDATE payouts SET status = $2, item_id = COALESCE($3, item_id),
                 failure_reason = $4, completed_at = $5
               WHERE id = $1 AND status = ANY($6)"#,
        )
        .bind(updated.id)
        .bind(updated.status.as_str())
        .bind(&updated.item_id)
        .bind(&updated.failure_reason)
        .bind(updated.completed_at)
        .bind(&from)
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        let paid = sqlx::query(
            r#"UPDATE referrals SET status = 'paid', payout_id = $2, updated_at = $3
               WHERE affiliate_id = $1 AND status = 'approved'"#,
        )
        .bind(updated.affiliate_id)
        .bind(updated.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(paid.rows_affected()))
    }

    async fn insert_review_item(&self, item: &ReviewItem) -> LedgerResult<bool> {
        let res = sqlx::query(
            r#"INSERT INTO review_items (id, kind, affiliate_id, referral_id, order_id, score,
                 details, resolved, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(item.id)
        .bind(item.kind.as_str())
        .bind(item.affiliate_id)
        .bind(item.referral_id)
        .bind(&item.order_id)
        .bind(item.score)
        .bind(&item.details)
        .bind(item.resolved)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn list_open_review_items(&self) -> LedgerResult<Vec<ReviewItem>> {
        let rows = sqlx::query_as::<_, ReviewRow>(
            r#"SELECT id, kind, affiliate_id, referral_id, order_id, score, details, resolved, created_at
               FROM review_items WHERE NOT resolved ORDER BY created_at"#,
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn resolve_review_item(&self, id: Uuid) -> LedgerResult<bool> {
        let res = sqlx::query(r#"UPDATE review_items SET resolved = TRUE WHERE id = $1 AND NOT resolved"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn insert_system_error(&self, e: &SystemError) -> LedgerResult<()> {
        sqlx::query(
            r#"INSERT INTO system_errors (id, severity, error_type, source, message, context, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(e.id)
        .bind(e.severity.as_str())
        .bind(&e.error_type)
        .bind(&e.source)
        .bind(&e.message)
        .bind(&e.context)
        .bind(e.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
