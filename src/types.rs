use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Returned when a stored or submitted status string is not a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a lowercase string-backed enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Lifecycle of an affiliate account. Affiliates are never hard-deleted.
    AffiliateStatus, "affiliate status", {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Inactive => "inactive",
    }
);

string_enum!(
    /// Where a monetizable event originated.
    OrderSource, "order source", {
        Storefront => "storefront",
        Subscription => "subscription",
    }
);

string_enum!(
    /// Referral state machine: `pending -> approved -> paid`, with `refunded`
    /// and `rejected` as the other terminal states.
    ReferralStatus, "referral status", {
        Pending => "pending",
        Approved => "approved",
        Paid => "paid",
        Refunded => "refunded",
        Rejected => "rejected",
    }
);

string_enum!(
    PayoutMethod, "payout method", {
        Paypal => "paypal",
        Manual => "manual",
        StoreCredit => "store_credit",
    }
);

string_enum!(
    /// `pending`/`processing` are provisional; `completed` and `failed` are terminal.
    PayoutStatus, "payout status", {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

string_enum!(
    Severity, "severity", {
        Info => "info",
        Warning => "warning",
        Error => "error",
        Critical => "critical",
    }
);

string_enum!(
    /// Reasons an item lands in the manual-review queue.
    ReviewKind, "review kind", {
        FraudFlag => "fraud_flag",
        ApplicationFlag => "application_flag",
        SelfReferral => "self_referral",
        RefundAfterPayout => "refund_after_payout",
    }
);

impl ReferralStatus {
    /// Whether the referral counts toward earned commission.
    pub fn is_earned(&self) -> bool {
        matches!(self, Self::Approved | Self::Paid)
    }

    /// Whether the referral counts toward `total_referrals` and revenue.
    pub fn is_countable(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved | Self::Paid)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Refunded | Self::Rejected)
    }

    /// Transitions reachable by admin action or refund. `paid` is only set by
    /// payout completion.
    pub fn can_transition_to(&self, next: ReferralStatus) -> bool {
        use ReferralStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Refunded)
                | (Approved, Rejected) | (Approved, Refunded)
        )
    }
}

impl PayoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const OPEN: [PayoutStatus; 2] = [PayoutStatus::Pending, PayoutStatus::Processing];
}

/// Aggregate counters derived from an affiliate's referral and payout rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateStats {
    pub total_referrals: i64,
    pub total_revenue: Decimal,
    pub total_commission_earned: Decimal,
    pub total_commission_paid: Decimal,
    pub balance_owed: Decimal,
}

/// A partner earning commission on referred sales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affiliate {
    pub id: Uuid,
    /// Subject id issued by the identity provider.
    pub auth_subject: String,
    pub email: String,
    pub status: AffiliateStatus,
    /// Slug of the current tier.
    pub tier: String,
    pub commission_rate: Decimal,
    pub referral_code: String,
    /// Storefront-side code, provisioned on approval.
    pub discount_code: Option<String>,
    /// Disbursement destination for electronic payouts.
    pub payout_email: Option<String>,
    pub payout_email_verified: bool,
    pub stats: AffiliateStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Affiliate {
    /// The verified electronic payout destination, if any.
    pub fn verified_destination(&self) -> Option<&str> {
        match (&self.payout_email, self.payout_email_verified) {
            (Some(email), true) if !email.trim().is_empty() => Some(email.as_str()),
            _ => None,
        }
    }

    pub fn matches_code(&self, code: &str) -> bool {
        self.referral_code.eq_ignore_ascii_case(code)
            || self
                .discount_code
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case(code))
    }
}

/// A commission-rate bracket unlocked by cumulative referral count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub slug: String,
    pub name: String,
    pub min_referrals: i64,
    pub commission_rate: Decimal,
    pub perks: Vec<String>,
    pub sort_order: i32,
}

/// The customer an affiliate is credited with acquiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferredCustomer {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub storefront_customer_id: Option<String>,
    pub billing_customer_id: Option<String>,
    /// Lower-cased.
    pub email: Option<String>,
    pub first_order_id: String,
    pub created_at: DateTime<Utc>,
}

/// One commission-bearing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub customer_id: Option<Uuid>,
    /// External order or charge id; unique across the ledger.
    pub order_id: String,
    pub order_source: OrderSource,
    pub order_subtotal: Decimal,
    pub order_total: Decimal,
    /// Rate snapshot taken at creation.
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub status: ReferralStatus,
    pub is_recurring: bool,
    pub payout_id: Option<Uuid>,
    pub discount_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One disbursement attempt to one affiliate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub amount: Decimal,
    pub method: PayoutMethod,
    pub status: PayoutStatus,
    pub batch_id: Option<String>,
    /// Processor-assigned item id, known once the item resolves.
    pub item_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payout {
    /// Idempotency tag sent to the processor for this payout's batch item.
    pub fn sender_item_id(&self) -> String {
        self.id.to_string()
    }
}

/// An entry in the manual-review queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub kind: ReviewKind,
    pub affiliate_id: Option<Uuid>,
    pub referral_id: Option<Uuid>,
    pub order_id: Option<String>,
    pub score: Option<i32>,
    pub details: serde_json::Value,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl ReviewItem {
    pub fn new(kind: ReviewKind, details: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            affiliate_id: None,
            referral_id: None,
            order_id: None,
            score: None,
            details,
            resolved: false,
            created_at: now,
        }
    }

    pub fn affiliate(mut self, id: Uuid) -> Self {
        self.affiliate_id = Some(id);
        self
    }

    pub fn referral(mut self, id: Uuid) -> Self {
        self.referral_id = Some(id);
        self
    }

    pub fn order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn score(mut self, score: u32) -> Self {
        self.score = Some(score as i32);
        self
    }
}

/// Append-only diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemError {
    pub id: Uuid,
    pub severity: Severity,
    pub error_type: String,
    pub source: String,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SystemError {
    pub fn new(
        severity: Severity,
        error_type: impl Into<String>,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            error_type: error_type.into(),
            source: source.into(),
            message: message.into(),
            context: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
