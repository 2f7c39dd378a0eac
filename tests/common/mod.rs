#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use affiliate_ledger::attribution::OrderEvent;
use affiliate_ledger::auth::AdminAuthorizer;
use affiliate_ledger::customer::CustomerKeys;
use affiliate_ledger::ledger::{LedgerStore, MemoryLedger};
use affiliate_ledger::notify::{EventName, Notification, Notifier, NotifyError};
use affiliate_ledger::processor::{
    BatchReceipt, BatchRequest, BatchStatus, PaymentProcessor, ProcessorError, RemoteItem,
    RemoteItemStatus,
};
use affiliate_ledger::signature::{WebhookVerifier, WebhookVerifiers};
use affiliate_ledger::storefront::{DiscountProvisioner, ProvisionError};
use affiliate_ledger::types::{Affiliate, AffiliateStats, AffiliateStatus, OrderSource, Tier};
use affiliate_ledger::{AppState, Capabilities, Settings};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

pub const STOREFRONT_SECRET: &str = "storefront-secret";
pub const SUBSCRIPTION_SECRET: &str = "subscription-secret";
pub const DISBURSEMENT_SECRET: &str = "disbursement-secret";
pub const ADMIN: &str = "auth0|admin";

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn tiers() -> Vec<Tier> {
    vec![
        Tier {
            slug: "initiate".into(),
            name: "Initiate".into(),
            min_referrals: 0,
            commission_rate: dec("0.10"),
            perks: vec![],
            sort_order: 1,
        },
        Tier {
            slug: "adept".into(),
            name: "Adept".into(),
            min_referrals: 6,
            commission_rate: dec("0.15"),
            perks: vec!["early access".into()],
            sort_order: 2,
        },
        Tier {
            slug: "master".into(),
            name: "Master".into(),
            min_referrals: 25,
            commission_rate: dec("0.20"),
            perks: vec!["early access".into(), "custom code".into()],
            sort_order: 3,
        },
    ]
}

/// Captures every notification instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    /// Makes every send fail after recording it.
    pub fail: AtomicBool,
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn count(&self, event: EventName) -> usize {
        self.sent.lock().unwrap().iter().filter(|n| n.event == event).count()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        Ok(())
    }
}

/// In-process stand-in for the disbursement processor.
#[derive(Default)]
pub struct FakeProcessor {
    submitted: Mutex<Vec<BatchRequest>>,
    statuses: Mutex<HashMap<String, BatchStatus>>,
    reject_batches: AtomicBool,
    lose_receipts: AtomicBool,
}

impl FakeProcessor {
    pub fn submitted(&self) -> Vec<BatchRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn reject_batches(&self, reject: bool) {
        self.reject_batches.store(reject, Ordering::SeqCst);
    }

    /// Accepts batches but fails as if the reply never arrived.
    pub fn lose_receipts(&self, lose: bool) {
        self.lose_receipts.store(lose, Ordering::SeqCst);
    }

    /// Sets the status every item of `batch_id` reports on the next poll.
    pub fn resolve_batch(&self, batch_id: &str, status: RemoteItemStatus, raw: &str) {
        let submitted = self.submitted.lock().unwrap();
        let request = submitted
            .iter()
            .zip(1..)
            .find(|(_, n)| format!("BATCH-{n}") == batch_id)
            .map(|(r, _)| r.clone())
            .expect("unknown batch");
        let items = request
            .items
            .iter()
            .map(|item| RemoteItem {
                item_id: format!("ITEM-{}", item.sender_item_id),
                sender_item_id: Some(item.sender_item_id.clone()),
                status,
                raw_status: raw.to_string(),
                failure_reason: (status == RemoteItemStatus::Failed).then(|| "receiver unregistered".into()),
            })
            .collect();
        self.statuses.lock().unwrap().insert(
            batch_id.to_string(),
            BatchStatus {
                batch_id: batch_id.to_string(),
                batch_status: "SUCCESS".into(),
                items,
            },
        );
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_batch(&self, batch: &BatchRequest) -> Result<BatchReceipt, ProcessorError> {
        tokio::task::yield_now().await;
        if self.reject_batches.load(Ordering::SeqCst) {
            return Err(ProcessorError::Status {
                status: 422,
                body: "INSUFFICIENT_FUNDS".into(),
            });
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(batch.clone());
        if self.lose_receipts.load(Ordering::SeqCst) {
            return Err(ProcessorError::OutcomeUnknown("operation timed out".into()));
        }
        Ok(BatchReceipt {
            batch_id: format!("BATCH-{}", submitted.len()),
            batch_status: "PENDING".into(),
        })
    }

    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, ProcessorError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(batch_id)
            .cloned()
            .unwrap_or_else(|| BatchStatus {
                batch_id: batch_id.to_string(),
                batch_status: "PROCESSING".into(),
                items: vec![],
            }))
    }
}

/// Records requested codes and echoes them back.
#[derive(Default)]
pub struct FakeProvisioner {
    pub fail: AtomicBool,
    created: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiscountProvisioner for FakeProvisioner {
    async fn create_discount_code(&self, code: &str, _discount: Decimal) -> Result<String, ProvisionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProvisionError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.created.lock().unwrap().push(code.to_string());
        Ok(code.to_string())
    }
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub processor: Arc<FakeProcessor>,
    pub provisioner: Arc<FakeProvisioner>,
    pub state: AppState,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_secrets(None, None, None)
    }

    /// All three webhook sources verified with the test secrets.
    pub fn signed() -> Self {
        Self::with_secrets(Some(STOREFRONT_SECRET), Some(SUBSCRIPTION_SECRET), Some(DISBURSEMENT_SECRET))
    }

    fn with_secrets(storefront: Option<&str>, subscription: Option<&str>, disbursement: Option<&str>) -> Self {
        let ledger = Arc::new(MemoryLedger::with_tiers(tiers()));
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = Arc::new(FakeProcessor::default());
        let provisioner = Arc::new(FakeProvisioner::default());
        let state = AppState::new(
            ledger.clone(),
            Capabilities {
                processor: processor.clone(),
                notifier: notifier.clone(),
                provisioner: provisioner.clone(),
            },
            Settings {
                verifiers: WebhookVerifiers {
                    storefront: WebhookVerifier::storefront(storefront),
                    subscription: WebhookVerifier::subscription(subscription),
                    disbursement: WebhookVerifier::disbursement(disbursement),
                },
                admins: AdminAuthorizer::from_csv(ADMIN),
                min_payout: dec("25.00"),
                customer_discount: dec("0.10"),
            },
        );
        Self {
            ledger,
            notifier,
            processor,
            provisioner,
            state,
        }
    }

    /// Inserts an approved affiliate on the entry tier with a verified payout email.
    pub async fn affiliate(&self, code: &str, email: &str) -> Affiliate {
        self.affiliate_with(code, email, true).await
    }

    pub async fn affiliate_with(&self, code: &str, email: &str, payout_email_verified: bool) -> Affiliate {
        let now = Utc::now();
        let affiliate = Affiliate {
            id: Uuid::new_v4(),
            auth_subject: format!("auth0|{}", code.to_lowercase()),
            email: email.to_string(),
            status: AffiliateStatus::Approved,
            tier: "initiate".into(),
            commission_rate: dec("0.10"),
            referral_code: code.to_string(),
            discount_code: None,
            payout_email: Some(email.to_string()),
            payout_email_verified,
            stats: AffiliateStats::default(),
            created_at: now,
            updated_at: now,
        };
        self.ledger.insert_affiliate(&affiliate).await.unwrap();
        affiliate
    }

    pub async fn reload(&self, id: Uuid) -> Affiliate {
        self.ledger.find_affiliate(id).await.unwrap().unwrap()
    }
}

pub fn storefront_order(order_id: &str, code: &str, email: &str, subtotal: &str) -> OrderEvent {
    OrderEvent {
        order_id: order_id.to_string(),
        source: OrderSource::Storefront,
        discount_codes: vec![code.to_string()],
        customer: CustomerKeys::new(None, None, Some(email.to_string())),
        subtotal: dec(subtotal),
        total: dec(subtotal),
        is_recurring: false,
    }
}
