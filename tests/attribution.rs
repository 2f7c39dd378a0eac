mod common;

use affiliate_ledger::attribution::{AttributionError, AttributionOutcome, RefundEvent, RefundOutcome};
use affiliate_ledger::customer::CustomerKeys;
use affiliate_ledger::ledger::LedgerStore;
use affiliate_ledger::notify::EventName;
use affiliate_ledger::types::{OrderSource, ReferralStatus, ReviewKind, Severity};
use chrono::Utc;
use common::{Harness, dec, storefront_order};
use tokio_test::assert_ok;

#[tokio::test]
async fn order_with_code_records_pending_referral_at_snapshot_rate() {
    let h = Harness::new();
    let alice = h.affiliate("ALICE10", "alice@example.com").await;

    let outcome = assert_ok!(
        h.state
            .attribution
            .record_order(&storefront_order("1001", "alice10", "buyer@example.com", "100.00"), Utc::now())
            .await
    );
    let AttributionOutcome::Recorded {
        affiliate_id,
        commission_amount,
        flagged,
        ..
    } = outcome
    else {
        panic!("expected a recorded referral, got {outcome:?}");
    };
    assert_eq!(affiliate_id, alice.id);
    assert_eq!(commission_amount, dec("10.00"));
    assert!(!flagged);

    let referral = h.ledger.find_referral_by_order("1001").await.unwrap().unwrap();
    assert_eq!(referral.status, ReferralStatus::Pending);
    assert_eq!(referral.commission_rate, dec("0.10"));
    assert_eq!(referral.order_source, OrderSource::Storefront);
    assert!(referral.customer_id.is_some());
    assert_eq!(h.notifier.count(EventName::ReferralCreated), 1);
    assert_eq!(h.reload(alice.id).await.stats.total_referrals, 1);
}

#[tokio::test]
async fn redelivered_order_is_a_duplicate() {
    let h = Harness::new();
    h.affiliate("ALICE10", "alice@example.com").await;
    let event = storefront_order("1001", "ALICE10", "buyer@example.com", "100.00");

    let first = h.state.attribution.record_order(&event, Utc::now()).await.unwrap();
    assert!(matches!(first, AttributionOutcome::Recorded { .. }));
    let second = h.state.attribution.record_order(&event, Utc::now()).await.unwrap();
    assert_eq!(second, AttributionOutcome::Duplicate);

    assert_eq!(h.ledger.referrals().await.len(), 1);
    assert_eq!(h.notifier.count(EventName::ReferralCreated), 1);
}

#[tokio::test]
async fn concurrent_deliveries_record_one_referral() {
    let h = Harness::new();
    h.affiliate("ALICE10", "alice@example.com").await;
    let event = storefront_order("1001", "ALICE10", "buyer@example.com", "100.00");

    let (a, b) = tokio::join!(
        h.state.attribution.record_order(&event, Utc::now()),
        h.state.attribution.record_order(&event, Utc::now()),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let recorded = outcomes
        .iter()
        .filter(|o| matches!(o, AttributionOutcome::Recorded { .. }))
        .count();
    assert_eq!(recorded, 1);
    assert!(outcomes.contains(&AttributionOutcome::Duplicate));
    assert_eq!(h.ledger.referrals().await.len(), 1);
}

#[tokio::test]
async fn self_referral_is_blocked_and_queued() {
    let h = Harness::new();
    let alice = h.affiliate("ALICE10", "alice@example.com").await;

    let outcome = h
        .state
        .attribution
        .record_order(&storefront_order("1001", "ALICE10", "Alice@Example.com", "100.00"), Utc::now())
        .await
        .unwrap();

    assert_eq!(outcome, AttributionOutcome::SelfReferral { affiliate_id: alice.id });
    assert!(h.ledger.referrals().await.is_empty());
    let queue = h.ledger.list_open_review_items().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].kind, ReviewKind::SelfReferral);
    assert_eq!(queue[0].order_id.as_deref(), Some("1001"));
}

#[tokio::test]
async fn redelivered_self_referral_is_queued_once() {
    let h = Harness::new();
    let alice = h.affiliate("ALICE10", "alice@example.com").await;
    let order = storefront_order("1001", "ALICE10", "alice@example.com", "100.00");

    for _ in 0..3 {
        let outcome = h.state.attribution.record_order(&order, Utc::now()).await.unwrap();
        assert_eq!(outcome, AttributionOutcome::SelfReferral { affiliate_id: alice.id });
    }

    let queue = h.ledger.list_open_review_items().await.unwrap();
    assert_eq!(queue.len(), 1);

    // Once resolved, a fresh occurrence is queued again.
    assert!(h.ledger.resolve_review_item(queue[0].id).await.unwrap());
    h.state.attribution.record_order(&order, Utc::now()).await.unwrap();
    assert_eq!(h.ledger.list_open_review_items().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_or_unapproved_code_attributes_nothing() {
    let h = Harness::new();
    let outcome = h
        .state
        .attribution
        .record_order(&storefront_order("1001", "NOBODY", "buyer@example.com", "100.00"), Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, AttributionOutcome::NoAffiliate);
    assert!(h.ledger.referrals().await.is_empty());
}

#[tokio::test]
async fn negative_amounts_are_rejected_without_retry() {
    let h = Harness::new();
    h.affiliate("ALICE10", "alice@example.com").await;
    let err = h
        .state
        .attribution
        .record_order(&storefront_order("1001", "ALICE10", "buyer@example.com", "-5.00"), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AttributionError::InvalidOrder { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn sixth_referral_upgrades_tier_once_and_keeps_old_snapshots() {
    let h = Harness::new();
    let alice = h.affiliate("ALICE10", "alice@example.com").await;

    let mut upgrades = Vec::new();
    for n in 1..=6 {
        let event = storefront_order(&format!("o-{n}"), "ALICE10", &format!("buyer{n}@example.com"), "100.00");
        if let AttributionOutcome::Recorded { tier_upgraded_to, .. } =
            h.state.attribution.record_order(&event, Utc::now()).await.unwrap()
        {
            upgrades.push(tier_upgraded_to);
        }
    }
    assert_eq!(upgrades.len(), 6);
    assert_eq!(upgrades[5].as_deref(), Some("adept"));
    assert!(upgrades[..5].iter().all(Option::is_none));

    let alice = h.reload(alice.id).await;
    assert_eq!(alice.tier, "adept");
    assert_eq!(alice.commission_rate, dec("0.15"));
    assert_eq!(h.notifier.count(EventName::TierUpgraded), 1);

    // Earlier referrals keep the rate they were created at.
    let referrals = h.ledger.referrals().await;
    assert!(referrals.iter().all(|r| r.commission_rate == dec("0.10")));

    let seventh = h
        .state
        .attribution
        .record_order(&storefront_order("o-7", "ALICE10", "buyer7@example.com", "100.00"), Utc::now())
        .await
        .unwrap();
    assert!(matches!(
        seventh,
        AttributionOutcome::Recorded { commission_amount, .. } if commission_amount == dec("15.00")
    ));
    assert_eq!(h.notifier.count(EventName::TierUpgraded), 1);
}

#[tokio::test]
async fn burst_of_referrals_is_flagged_for_review() {
    let h = Harness::new();
    h.affiliate("ALICE10", "alice@example.com").await;

    let mut last = None;
    for n in 1..=11 {
        let event = storefront_order(&format!("o-{n}"), "ALICE10", &format!("buyer{n}@example.com"), "50.00");
        last = Some(h.state.attribution.record_order(&event, Utc::now()).await.unwrap());
    }

    assert!(matches!(last, Some(AttributionOutcome::Recorded { flagged: true, .. })));
    let flagged: Vec<_> = h
        .ledger
        .list_open_review_items()
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.kind == ReviewKind::FraudFlag)
        .collect();
    assert!(!flagged.is_empty());
    assert!(flagged.iter().all(|i| i.score.unwrap_or_default() >= 30));
    // Flagged referrals are still recorded.
    assert_eq!(h.ledger.referrals().await.len(), 11);
}

#[tokio::test]
async fn refund_before_payout_marks_referral_refunded() {
    let h = Harness::new();
    let alice = h.affiliate("ALICE10", "alice@example.com").await;
    h.state
        .attribution
        .record_order(&storefront_order("1001", "ALICE10", "buyer@example.com", "100.00"), Utc::now())
        .await
        .unwrap();

    let refund = RefundEvent {
        order_id: "1001".into(),
        source: OrderSource::Storefront,
        refund_id: Some("r-1".into()),
    };
    let outcome = h.state.attribution.record_refund(&refund, Utc::now()).await.unwrap();
    assert!(matches!(outcome, RefundOutcome::Refunded { .. }));

    let referral = h.ledger.find_referral_by_order("1001").await.unwrap().unwrap();
    assert_eq!(referral.status, ReferralStatus::Refunded);
    let stats = h.reload(alice.id).await.stats;
    assert_eq!(stats.total_referrals, 0);
    assert_eq!(stats.balance_owed, dec("0"));

    let again = h.state.attribution.record_refund(&refund, Utc::now()).await.unwrap();
    assert!(matches!(
        again,
        RefundOutcome::AlreadyFinal { status: ReferralStatus::Refunded, .. }
    ));
}

#[tokio::test]
async fn refund_after_payout_goes_to_review_and_stays_paid() {
    let h = Harness::new();
    let alice = h.affiliate("ALICE10", "alice@example.com").await;
    h.state
        .attribution
        .record_order(&storefront_order("1001", "ALICE10", "buyer@example.com", "100.00"), Utc::now())
        .await
        .unwrap();
    let referral = h.ledger.find_referral_by_order("1001").await.unwrap().unwrap();
    let now = Utc::now();
    h.ledger
        .set_referral_status(referral.id, ReferralStatus::Pending, ReferralStatus::Approved, now)
        .await
        .unwrap();
    h.ledger
        .set_referral_status(referral.id, ReferralStatus::Approved, ReferralStatus::Paid, now)
        .await
        .unwrap();

    let outcome = h
        .state
        .attribution
        .record_refund(
            &RefundEvent {
                order_id: "1001".into(),
                source: OrderSource::Storefront,
                refund_id: Some("r-1".into()),
            },
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, RefundOutcome::NeedsReview { referral_id: referral.id });
    let stored = h.ledger.find_referral(referral.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ReferralStatus::Paid);
    let queue = h.ledger.list_open_review_items().await.unwrap();
    assert!(queue.iter().any(|i| i.kind == ReviewKind::RefundAfterPayout && i.referral_id == Some(referral.id)));
    assert!(
        h.ledger
            .system_errors()
            .await
            .iter()
            .any(|e| e.error_type == "refund_after_payout" && e.severity == Severity::Warning)
    );
}

#[tokio::test]
async fn refund_for_unattributed_order_is_ignored() {
    let h = Harness::new();
    let outcome = h
        .state
        .attribution
        .record_refund(
            &RefundEvent {
                order_id: "nope".into(),
                source: OrderSource::Storefront,
                refund_id: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, RefundOutcome::NotAttributed);
}

#[tokio::test]
async fn subscription_renewal_follows_the_acquired_customer() {
    let h = Harness::new();
    let alice = h.affiliate("ALICE10", "alice@example.com").await;

    let mut first = storefront_order("5501", "ALICE10", "sub@example.com", "40.00");
    first.customer = CustomerKeys::new(Some("77".into()), None, Some("sub@example.com".into()));
    h.state.attribution.record_order(&first, Utc::now()).await.unwrap();

    // The renewal carries no code, only the billing platform's view of the customer.
    let renewal = affiliate_ledger::attribution::OrderEvent {
        order_id: "charge-9001".into(),
        source: OrderSource::Subscription,
        discount_codes: vec![],
        customer: CustomerKeys::new(Some("77".into()), Some("311".into()), Some("sub@example.com".into())),
        subtotal: dec("40.00"),
        total: dec("43.20"),
        is_recurring: true,
    };
    let outcome = h.state.attribution.record_order(&renewal, Utc::now()).await.unwrap();
    assert!(matches!(
        outcome,
        AttributionOutcome::Recorded { affiliate_id, .. } if affiliate_id == alice.id
    ));

    let referral = h.ledger.find_referral_by_order("charge-9001").await.unwrap().unwrap();
    assert!(referral.is_recurring);
    assert_eq!(referral.order_source, OrderSource::Subscription);

    let customers = h.ledger.customers().await;
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].billing_customer_id.as_deref(), Some("311"));
    assert_eq!(customers[0].first_order_id, "5501");
}
