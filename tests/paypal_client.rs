use std::time::Duration;

use affiliate_ledger::backoff::Backoff;
use affiliate_ledger::processor::{
    BatchItem, BatchRequest, PaymentProcessor, PaypalClient, ProcessorError, RemoteItemStatus,
};
use rust_decimal::Decimal;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, backoff: Backoff) -> PaypalClient {
    PaypalClient::new(&server.uri(), "client-id", "client-secret", Duration::from_secs(5), backoff).unwrap()
}

async fn mount_token(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-1",
            "token_type": "Bearer",
            "expires_in": 32400
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn batch() -> BatchRequest {
    BatchRequest {
        sender_batch_id: "sb-1".into(),
        items: vec![BatchItem {
            receiver: "alice@example.com".into(),
            amount: Decimal::new(3000, 2),
            sender_item_id: "p-1".into(),
            note: "Commission payout".into(),
        }],
    }
}

#[tokio::test]
async fn token_is_cached_across_calls() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/payments/payouts"))
        .and(header("authorization", "Bearer tok-1"))
        .and(body_partial_json(json!({
            "sender_batch_header": { "sender_batch_id": "sb-1" },
            "items": [{ "receiver": "alice@example.com", "sender_item_id": "p-1", "amount": { "value": "30.00" } }]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "batch_header": { "payout_batch_id": "B-77", "batch_status": "PENDING" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/payments/payouts/B-77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch_header": { "payout_batch_id": "B-77", "batch_status": "SUCCESS" },
            "items": [
                {
                    "payout_item_id": "I-1",
                    "transaction_status": "SUCCESS",
                    "payout_item": { "sender_item_id": "p-1" }
                },
                {
                    "payout_item_id": "I-2",
                    "transaction_status": "RETURNED",
                    "payout_item": { "sender_item_id": "p-2" },
                    "errors": { "name": "RECEIVER_UNREGISTERED", "message": "Receiver is unregistered" }
                },
                {
                    "payout_item_id": "I-3",
                    "transaction_status": "UNCLAIMED",
                    "payout_item": { "sender_item_id": "p-3" }
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, Backoff::none());
    let receipt = client.create_batch(&batch()).await.unwrap();
    assert_eq!(receipt.batch_id, "B-77");

    let status = client.batch_status("B-77").await.unwrap();
    assert_eq!(status.batch_status, "SUCCESS");
    assert_eq!(status.items.len(), 3);
    assert_eq!(status.items[0].status, RemoteItemStatus::Succeeded);
    assert_eq!(status.items[0].sender_item_id.as_deref(), Some("p-1"));
    assert_eq!(status.items[1].status, RemoteItemStatus::Failed);
    assert_eq!(status.items[1].failure_reason.as_deref(), Some("Receiver is unregistered"));
    assert_eq!(status.items[2].status, RemoteItemStatus::InFlight);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/payments/payouts"))
        .respond_with(ResponseTemplate::new(422).set_body_string("INSUFFICIENT_FUNDS"))
        .expect(1)
        .mount(&server)
        .await;

    let backoff = Backoff {
        max_attempts: 3,
        base: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    let err = client(&server, backoff).create_batch(&batch()).await.unwrap_err();
    match err {
        ProcessorError::Status { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body, "INSUFFICIENT_FUNDS");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_are_retried_until_attempts_run_out() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("GET"))
        .and(path("/v1/payments/payouts/B-1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let backoff = Backoff {
        max_attempts: 3,
        base: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    let err = client(&server, backoff).batch_status("B-1").await.unwrap_err();
    assert!(err.is_retryable());
}

fn retrying() -> Backoff {
    Backoff {
        max_attempts: 3,
        base: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

#[tokio::test]
async fn timed_out_submission_is_not_resent() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/payments/payouts"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({
                    "batch_header": { "payout_batch_id": "B-77", "batch_status": "PENDING" }
                }))
                .set_delay(Duration::from_millis(800)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = PaypalClient::new(
        &server.uri(),
        "client-id",
        "client-secret",
        Duration::from_millis(300),
        retrying(),
    )
    .unwrap();
    let err = client.create_batch(&batch()).await.unwrap_err();
    assert!(err.is_outcome_unknown(), "unexpected error: {err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_error_on_submission_is_not_resent() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/payments/payouts"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, retrying()).create_batch(&batch()).await.unwrap_err();
    assert!(err.is_outcome_unknown(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn duplicate_batch_reply_is_an_unknown_outcome() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/payments/payouts"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "name": "DUPLICATE_REQUEST_ID",
            "message": "Requested resource ID was already used."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, retrying()).create_batch(&batch()).await.unwrap_err();
    assert!(err.is_outcome_unknown(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn rejected_credentials_surface_as_status_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_client"))
        .mount(&server)
        .await;

    let err = client(&server, Backoff::none()).batch_status("B-1").await.unwrap_err();
    assert!(matches!(err, ProcessorError::Status { status: 400, .. }));
}
