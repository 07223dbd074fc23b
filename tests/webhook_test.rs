mod common;

use common::{payment_event_body, refund_event_body, TestApp, TEST_USER, WEBHOOK_SECRET};
use serde_json::json;
use subscription_service::models::payment::{NewPaymentRecord, PaymentRecord, RequestMetadata};
use subscription_service::models::{BillingCycle, PaymentStatus, PlanTier};
use subscription_service::services::razorpay::sign_webhook_body;
use subscription_service::services::{PaymentStore, SubscriptionStore};
use subscription_service::webhooks::{ProcessOutcome, WebhookProcessor};

const PRO_MONTHLY: u64 = 49_900;

/// Insert a created-state payment record the way the order pipeline
/// would, without going through the gateway.
async fn seed_order(app: &TestApp, order_id: &str, amount: u64) -> PaymentRecord {
    let subscription = app.state.activation.get_or_create(TEST_USER).await.unwrap();
    let record = PaymentRecord::new(
        NewPaymentRecord {
            user_id: TEST_USER.to_string(),
            subscription_id: subscription.id,
            plan: PlanTier::Pro,
            billing_cycle: BillingCycle::Monthly,
            gateway_order_id: order_id.to_string(),
            receipt: format!("rcpt_pro_monthly_test_{}", order_id),
            amount,
            currency: "INR".to_string(),
            base_amount: amount,
            discount_amount: 0,
            discount_code: None,
            referral_credit_applied: 0,
            metadata: RequestMetadata::default(),
        },
        chrono::Utc::now(),
    );
    app.state.payments.insert(&record).await.unwrap();
    record
}

fn processor(app: &TestApp) -> WebhookProcessor {
    WebhookProcessor::new(app.state.payments.clone(), app.state.activation.clone())
}

async fn handle(app: &TestApp, body: &str) -> ProcessOutcome {
    let event = app.state.razorpay.parse_webhook_event(body).unwrap();
    processor(app).handle_event(&event).await.unwrap()
}

#[tokio::test]
async fn replayed_capture_applies_once() {
    let app = TestApp::spawn().await;
    seed_order(&app, "order_rep", PRO_MONTHLY).await;
    let body = payment_event_body("payment.captured", "pay_rep", "order_rep", PRO_MONTHLY);

    assert_eq!(handle(&app, &body).await, ProcessOutcome::Applied);
    assert_eq!(handle(&app, &body).await, ProcessOutcome::Duplicate);
    assert_eq!(handle(&app, &body).await, ProcessOutcome::Duplicate);

    let record = app
        .state
        .payments
        .find_by_order_id("order_rep")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Captured);
    assert!(record.webhook_received);
    assert!(record.webhook_received_at.is_some());

    // Exactly one activation across the three deliveries.
    let subscription = app
        .state
        .subscriptions
        .find_by_user(TEST_USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.plan, PlanTier::Pro);
    assert_eq!(subscription.upgrade_history.len(), 1);
}

#[tokio::test]
async fn http_webhook_acknowledges_then_captures_in_background() {
    let app = TestApp::spawn().await;
    seed_order(&app, "order_http", PRO_MONTHLY).await;

    let body = payment_event_body("payment.captured", "pay_http", "order_http", PRO_MONTHLY);
    let signature = sign_webhook_body(&body, WEBHOOK_SECRET);

    let status = app.post_webhook(&body, Some(&signature)).await;
    assert_eq!(status, 200);

    // Processing is deferred; poll the store for the transition.
    let mut captured = false;
    for _ in 0..100 {
        let record = app
            .state
            .payments
            .find_by_order_id("order_http")
            .await
            .unwrap()
            .unwrap();
        if record.status == PaymentStatus::Captured {
            captured = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(captured, "webhook worker never captured the payment");

    let subscription = app
        .state
        .subscriptions
        .find_by_user(TEST_USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.plan, PlanTier::Pro);
}

#[tokio::test]
async fn webhook_without_valid_signature_is_rejected() {
    let app = TestApp::spawn().await;
    seed_order(&app, "order_sig", PRO_MONTHLY).await;
    let body = payment_event_body("payment.captured", "pay_sig", "order_sig", PRO_MONTHLY);

    assert_eq!(app.post_webhook(&body, None).await, 400);
    assert_eq!(app.post_webhook(&body, Some("forged")).await, 400);

    // Nothing was enqueued or written.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let record = app
        .state
        .payments
        .find_by_order_id("order_sig")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Created);
}

#[tokio::test]
async fn malformed_payload_from_verified_sender_is_acknowledged() {
    let app = TestApp::spawn().await;
    let body = r#"{"event": "payment.captured""#;
    let signature = sign_webhook_body(body, WEBHOOK_SECRET);

    assert_eq!(app.post_webhook(body, Some(&signature)).await, 200);
}

#[tokio::test]
async fn unknown_event_types_are_ignored() {
    let app = TestApp::spawn().await;
    let body = json!({
        "entity": "event",
        "account_id": "acc_test",
        "event": "invoice.expired",
        "contains": [],
        "payload": {},
        "created_at": 1722777701
    })
    .to_string();

    assert_eq!(handle(&app, &body).await, ProcessOutcome::Ignored);

    let signature = sign_webhook_body(&body, WEBHOOK_SECRET);
    assert_eq!(app.post_webhook(&body, Some(&signature)).await, 200);
}

#[tokio::test]
async fn webhook_amount_mismatch_fails_the_record() {
    let app = TestApp::spawn().await;
    seed_order(&app, "order_wam", PRO_MONTHLY).await;
    let body = payment_event_body("payment.captured", "pay_wam", "order_wam", 99_900);

    assert_eq!(handle(&app, &body).await, ProcessOutcome::Ignored);

    let record = app
        .state
        .payments
        .find_by_order_id("order_wam")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Failed);
    assert_eq!(record.failure.unwrap().code, "AMOUNT_MISMATCH");

    let subscription = app
        .state
        .subscriptions
        .find_by_user(TEST_USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.plan, PlanTier::Free);
}

#[tokio::test]
async fn capture_for_unknown_order_is_logged_not_fatal() {
    let app = TestApp::spawn().await;
    let body = payment_event_body("payment.captured", "pay_ghost", "order_ghost", PRO_MONTHLY);

    assert_eq!(handle(&app, &body).await, ProcessOutcome::MissingRecord);

    let signature = sign_webhook_body(&body, WEBHOOK_SECRET);
    assert_eq!(app.post_webhook(&body, Some(&signature)).await, 200);
}

#[tokio::test]
async fn authorized_then_captured_walks_the_state_machine() {
    let app = TestApp::spawn().await;
    seed_order(&app, "order_auth", PRO_MONTHLY).await;

    let authorized = json!({
        "entity": "event",
        "account_id": "acc_test",
        "event": "payment.authorized",
        "contains": ["payment"],
        "payload": {
            "payment": {
                "entity": {
                    "id": "pay_auth",
                    "entity": "payment",
                    "amount": PRO_MONTHLY,
                    "currency": "INR",
                    "status": "authorized",
                    "order_id": "order_auth",
                    "method": "card",
                    "created_at": 1722777700,
                    "captured": false
                }
            }
        },
        "created_at": 1722777701
    })
    .to_string();

    assert_eq!(handle(&app, &authorized).await, ProcessOutcome::Applied);
    let record = app
        .state
        .payments
        .find_by_order_id("order_auth")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Authorized);

    let captured = payment_event_body("payment.captured", "pay_auth", "order_auth", PRO_MONTHLY);
    assert_eq!(handle(&app, &captured).await, ProcessOutcome::Applied);

    let record = app
        .state
        .payments
        .find_by_order_id("order_auth")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Captured);

    let subscription = app
        .state
        .subscriptions
        .find_by_user(TEST_USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.plan, PlanTier::Pro);
    assert_eq!(subscription.upgrade_history.len(), 1);
}

#[tokio::test]
async fn gateway_failure_event_records_structured_detail() {
    let app = TestApp::spawn().await;
    seed_order(&app, "order_fail", PRO_MONTHLY).await;

    let body = json!({
        "entity": "event",
        "account_id": "acc_test",
        "event": "payment.failed",
        "contains": ["payment"],
        "payload": {
            "payment": {
                "entity": {
                    "id": "pay_fail",
                    "entity": "payment",
                    "amount": PRO_MONTHLY,
                    "currency": "INR",
                    "status": "failed",
                    "order_id": "order_fail",
                    "method": "card",
                    "error_code": "BAD_REQUEST_ERROR",
                    "error_description": "Payment declined by issuer",
                    "error_source": "bank",
                    "error_step": "payment_authorization",
                    "error_reason": "payment_declined",
                    "created_at": 1722777700,
                    "captured": false
                }
            }
        },
        "created_at": 1722777701
    })
    .to_string();

    assert_eq!(handle(&app, &body).await, ProcessOutcome::Applied);

    let record = app
        .state
        .payments
        .find_by_order_id("order_fail")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Failed);
    let failure = record.failure.unwrap();
    assert_eq!(failure.code, "BAD_REQUEST_ERROR");
    assert_eq!(failure.source.as_deref(), Some("bank"));
}

#[tokio::test]
async fn refund_transitions_captured_records_only() {
    let app = TestApp::spawn().await;
    seed_order(&app, "order_ref", PRO_MONTHLY).await;

    let captured = payment_event_body("payment.captured", "pay_ref", "order_ref", PRO_MONTHLY);
    assert_eq!(handle(&app, &captured).await, ProcessOutcome::Applied);

    let refund = refund_event_body("rfnd_1", "pay_ref", PRO_MONTHLY);
    assert_eq!(handle(&app, &refund).await, ProcessOutcome::Applied);

    let record = app
        .state
        .payments
        .find_by_order_id("order_ref")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Refunded);
    let detail = record.refund.unwrap();
    assert_eq!(detail.refund_id, "rfnd_1");
    assert_eq!(detail.amount, PRO_MONTHLY);

    // Replayed refund converges.
    assert_eq!(handle(&app, &refund).await, ProcessOutcome::Duplicate);

    // A refund for a payment this service never saw is a warning.
    let stray = refund_event_body("rfnd_2", "pay_unknown", PRO_MONTHLY);
    assert_eq!(handle(&app, &stray).await, ProcessOutcome::MissingRecord);
}

#[tokio::test]
async fn checkout_verification_and_webhook_converge_in_either_order() {
    use subscription_service::services::razorpay::sign_checkout;

    // Webhook first, checkout verification second.
    let app = TestApp::spawn().await;
    seed_order(&app, "order_conv", PRO_MONTHLY).await;

    let captured = payment_event_body("payment.captured", "pay_conv", "order_conv", PRO_MONTHLY);
    assert_eq!(handle(&app, &captured).await, ProcessOutcome::Applied);

    let (status, body) = app
        .post_json(
            "/subscription/verify-payment",
            Some(TEST_USER),
            json!({
                "razorpay_order_id": "order_conv",
                "razorpay_payment_id": "pay_conv",
                "razorpay_signature":
                    sign_checkout("order_conv", "pay_conv", common::KEY_SECRET),
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["is_duplicate"], true);

    let subscription = app
        .state
        .subscriptions
        .find_by_user(TEST_USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.upgrade_history.len(), 1);

    // Checkout verification first, webhook second.
    let app = TestApp::spawn().await;
    seed_order(&app, "order_conv2", PRO_MONTHLY).await;
    app.mock_payment_fetch("pay_conv2", "order_conv2", PRO_MONTHLY, "captured")
        .await;

    let (status, body) = app
        .post_json(
            "/subscription/verify-payment",
            Some(TEST_USER),
            json!({
                "razorpay_order_id": "order_conv2",
                "razorpay_payment_id": "pay_conv2",
                "razorpay_signature":
                    sign_checkout("order_conv2", "pay_conv2", common::KEY_SECRET),
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["is_duplicate"], false);

    let replay = payment_event_body("payment.captured", "pay_conv2", "order_conv2", PRO_MONTHLY);
    assert_eq!(handle(&app, &replay).await, ProcessOutcome::Duplicate);

    let subscription = app
        .state
        .subscriptions
        .find_by_user(TEST_USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.upgrade_history.len(), 1);
}
