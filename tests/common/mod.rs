#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use secrecy::Secret;
use serde_json::{json, Value};
use std::sync::Arc;
use subscription_service::config::{
    Config, DatabaseConfig, JobsConfig, RazorpayConfig, ServerConfig, SmtpConfig, WebhookConfig,
};
use subscription_service::services::memory::{InMemoryPaymentStore, InMemorySubscriptionStore};
use subscription_service::services::{MockNotifier, RazorpayClient};
use subscription_service::{app_router, AppState};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const KEY_SECRET: &str = "test_key_secret";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret";
pub const TEST_USER: &str = "user@example.com";

pub struct TestApp {
    pub state: AppState,
    pub router: axum::Router,
    pub gateway: MockServer,
    pub notifier: Arc<MockNotifier>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let gateway = MockServer::start().await;

        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: DatabaseConfig {
                url: Secret::new("mongodb://localhost:27017".to_string()),
                db_name: "subscription_test".to_string(),
            },
            razorpay: RazorpayConfig {
                key_id: "rzp_test_key".to_string(),
                key_secret: Secret::new(KEY_SECRET.to_string()),
                webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
                api_base_url: gateway.uri(),
                request_timeout_secs: 5,
            },
            smtp: SmtpConfig {
                enabled: false,
                host: "localhost".to_string(),
                port: 587,
                user: String::new(),
                password: Secret::new(String::new()),
                from_email: "billing@test".to_string(),
                from_name: "Billing".to_string(),
            },
            webhook: WebhookConfig { queue_size: 64 },
            jobs: JobsConfig {
                enabled: false,
                expiry_sweep_interval_secs: 3600,
                credit_reset_interval_secs: 3600,
                reminder_interval_secs: 3600,
            },
            service_name: "subscription-service-test".to_string(),
        };

        let notifier = Arc::new(MockNotifier::new());
        let razorpay = RazorpayClient::new(config.razorpay.clone());
        let state = AppState::new(
            config,
            Arc::new(InMemoryPaymentStore::new()),
            Arc::new(InMemorySubscriptionStore::new()),
            razorpay,
            notifier.clone(),
        );
        let router = app_router(state.clone());

        TestApp {
            state,
            router,
            gateway,
            notifier,
        }
    }

    /// Mount a gateway mock that answers order creation.
    pub async fn mock_order_creation(&self, order_id: &str, amount: u64) {
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": order_id,
                "entity": "order",
                "amount": amount,
                "amount_paid": 0,
                "amount_due": amount,
                "currency": "INR",
                "receipt": "rcpt_test",
                "status": "created",
                "attempts": 0,
                "notes": null,
                "created_at": 1722777600
            })))
            .mount(&self.gateway)
            .await;
    }

    /// Mount a gateway mock for the authoritative payment fetch.
    pub async fn mock_payment_fetch(
        &self,
        payment_id: &str,
        order_id: &str,
        amount: u64,
        status: &str,
    ) {
        Mock::given(method("GET"))
            .and(path(format!("/payments/{}", payment_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": payment_id,
                "entity": "payment",
                "amount": amount,
                "currency": "INR",
                "status": status,
                "order_id": order_id,
                "method": "card",
                "created_at": 1722777700,
                "captured": status == "captured"
            })))
            .mount(&self.gateway)
            .await;
    }

    pub async fn post_json(
        &self,
        uri: &str,
        user: Option<&str>,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("X-User-ID", user);
        }
        let request = builder
            .body(Body::from(body.to_string()))
            .expect("request builds");
        self.send(request).await
    }

    pub async fn get(&self, uri: &str, user: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(user) = user {
            builder = builder.header("X-User-ID", user);
        }
        let request = builder.body(Body::empty()).expect("request builds");
        self.send(request).await
    }

    /// Deliver a webhook body with the given signature header.
    pub async fn post_webhook(&self, body: &str, signature: Option<&str>) -> StatusCode {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/razorpay")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("X-Razorpay-Signature", signature);
        }
        let request = builder
            .body(Body::from(body.to_string()))
            .expect("request builds");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router handles request");
        response.status()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router handles request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collects")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }
}

/// A well-formed `payment.captured`-family webhook body.
pub fn payment_event_body(event: &str, payment_id: &str, order_id: &str, amount: u64) -> String {
    json!({
        "entity": "event",
        "account_id": "acc_test",
        "event": event,
        "contains": ["payment"],
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "entity": "payment",
                    "amount": amount,
                    "currency": "INR",
                    "status": "captured",
                    "order_id": order_id,
                    "method": "card",
                    "created_at": 1722777700,
                    "captured": true
                }
            }
        },
        "created_at": 1722777701
    })
    .to_string()
}

pub fn refund_event_body(refund_id: &str, payment_id: &str, amount: u64) -> String {
    json!({
        "entity": "event",
        "account_id": "acc_test",
        "event": "refund.processed",
        "contains": ["refund"],
        "payload": {
            "refund": {
                "entity": {
                    "id": refund_id,
                    "entity": "refund",
                    "amount": amount,
                    "currency": "INR",
                    "payment_id": payment_id,
                    "status": "processed",
                    "notes": { "reason": "requested_by_customer" },
                    "created_at": 1722777800
                }
            }
        },
        "created_at": 1722777801
    })
    .to_string()
}
