//! Razorpay payment provider client.
//!
//! Implements the Orders API for payment initiation, the Payments API
//! as the authoritative source of truth during verification, refunds,
//! and HMAC-SHA256 signature verification for both checkout
//! confirmations and webhook deliveries.

use crate::config::RazorpayConfig;
use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// Razorpay client for interacting with the Razorpay API.
///
/// Explicitly constructed at startup and injected wherever gateway
/// access is needed; holds no global state.
#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    config: RazorpayConfig,
}

/// Request to create a Razorpay order.
#[derive(Debug, Serialize)]
pub struct CreateOrderRequest {
    /// Amount in smallest currency unit (paise for INR).
    pub amount: u64,
    /// Currency code (e.g., "INR").
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<serde_json::Value>,
}

/// Response from Razorpay order creation.
#[derive(Debug, Deserialize)]
pub struct RazorpayOrder {
    /// Razorpay order ID.
    pub id: String,
    pub entity: String,
    pub amount: u64,
    pub amount_paid: u64,
    pub amount_due: u64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: String,
    pub attempts: u32,
    pub notes: Option<serde_json::Value>,
    pub created_at: u64,
}

/// Razorpay API error response.
#[derive(Debug, Deserialize)]
pub struct RazorpayError {
    pub error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct RazorpayErrorDetail {
    pub code: String,
    pub description: String,
    pub source: Option<String>,
    pub step: Option<String>,
    pub reason: Option<String>,
}

/// Payment verification parameters from checkout.
#[derive(Debug)]
pub struct PaymentVerification {
    pub razorpay_order_id: String,
    pub razorpay_payment_id: String,
    pub razorpay_signature: String,
}

/// Razorpay payment entity, as returned by the Payments API and
/// embedded in webhook payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    pub entity: String,
    pub amount: u64,
    pub currency: String,
    pub status: String,
    pub order_id: Option<String>,
    pub method: Option<String>,
    pub description: Option<String>,
    pub email: Option<String>,
    pub contact: Option<String>,
    pub error_code: Option<String>,
    pub error_description: Option<String>,
    pub error_source: Option<String>,
    pub error_step: Option<String>,
    pub error_reason: Option<String>,
    pub created_at: u64,
    pub captured: Option<bool>,
}

/// Razorpay refund entity.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundEntity {
    pub id: String,
    pub entity: String,
    pub amount: u64,
    pub currency: String,
    pub payment_id: String,
    pub status: String,
    pub notes: Option<serde_json::Value>,
    pub created_at: u64,
}

/// Gateway-side subscription entity carried by subscription.* events.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEntity {
    pub id: String,
    pub entity: String,
    pub plan_id: Option<String>,
    pub status: String,
    pub notes: Option<serde_json::Value>,
}

/// Razorpay webhook event envelope.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub entity: String,
    pub account_id: String,
    pub event: String,
    pub contains: Vec<String>,
    pub payload: WebhookPayload,
    pub created_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<WebhookPaymentEntity>,
    pub order: Option<WebhookOrderEntity>,
    pub refund: Option<WebhookRefundEntity>,
    pub subscription: Option<WebhookSubscriptionEntity>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPaymentEntity {
    pub entity: PaymentEntity,
}

#[derive(Debug, Deserialize)]
pub struct WebhookOrderEntity {
    pub entity: RazorpayOrder,
}

#[derive(Debug, Deserialize)]
pub struct WebhookRefundEntity {
    pub entity: RefundEntity,
}

#[derive(Debug, Deserialize)]
pub struct WebhookSubscriptionEntity {
    pub entity: SubscriptionEntity,
}

/// Closed set of webhook event types this service understands. New
/// gateway event types land in `Unknown` and surface in logs/metrics
/// instead of being silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    PaymentCaptured,
    PaymentFailed,
    PaymentAuthorized,
    OrderPaid,
    RefundProcessed,
    SubscriptionCharged,
    SubscriptionCancelled,
    SubscriptionCompleted,
    Unknown(String),
}

impl WebhookEventKind {
    pub fn parse(event: &str) -> Self {
        match event {
            "payment.captured" => WebhookEventKind::PaymentCaptured,
            "payment.failed" => WebhookEventKind::PaymentFailed,
            "payment.authorized" => WebhookEventKind::PaymentAuthorized,
            "order.paid" => WebhookEventKind::OrderPaid,
            "refund.processed" => WebhookEventKind::RefundProcessed,
            "subscription.charged" => WebhookEventKind::SubscriptionCharged,
            "subscription.cancelled" => WebhookEventKind::SubscriptionCancelled,
            "subscription.completed" => WebhookEventKind::SubscriptionCompleted,
            other => WebhookEventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WebhookEventKind::PaymentCaptured => "payment.captured",
            WebhookEventKind::PaymentFailed => "payment.failed",
            WebhookEventKind::PaymentAuthorized => "payment.authorized",
            WebhookEventKind::OrderPaid => "order.paid",
            WebhookEventKind::RefundProcessed => "refund.processed",
            WebhookEventKind::SubscriptionCharged => "subscription.charged",
            WebhookEventKind::SubscriptionCancelled => "subscription.cancelled",
            WebhookEventKind::SubscriptionCompleted => "subscription.completed",
            WebhookEventKind::Unknown(other) => other,
        }
    }
}

impl RazorpayClient {
    /// Create a new Razorpay client. Gateway calls carry a bounded
    /// timeout and fail closed when it elapses.
    pub fn new(config: RazorpayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    /// Check if Razorpay is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    pub fn key_id(&self) -> &str {
        &self.config.key_id
    }

    /// Create a new order in Razorpay.
    pub async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        receipt: Option<String>,
        notes: Option<serde_json::Value>,
    ) -> Result<RazorpayOrder> {
        if !self.is_configured() {
            return Err(anyhow!("Razorpay credentials not configured"));
        }

        let request = CreateOrderRequest {
            amount,
            currency: currency.to_string(),
            receipt,
            notes,
        };

        let url = format!("{}/orders", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, "Razorpay create_order response");

        if status.is_success() {
            let order: RazorpayOrder = serde_json::from_str(&body)?;
            tracing::info!(
                order_id = %order.id,
                amount = order.amount,
                currency = %order.currency,
                "Razorpay order created"
            );
            Ok(order)
        } else {
            let error = parse_gateway_error(&body);
            tracing::error!(
                code = %error.error.code,
                description = %error.error.description,
                "Razorpay order creation failed"
            );
            Err(anyhow!(
                "Razorpay error: {} - {}",
                error.error.code,
                error.error.description
            ))
        }
    }

    /// Fetch the authoritative payment object by payment id. Client
    /// claims about amount/status are never trusted; this is.
    pub async fn fetch_payment(&self, payment_id: &str) -> Result<PaymentEntity> {
        if !self.is_configured() {
            return Err(anyhow!("Razorpay credentials not configured"));
        }

        let url = format!("{}/payments/{}", self.config.api_base_url, payment_id);

        let response = self
            .client
            .get(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let payment: PaymentEntity = serde_json::from_str(&body)?;
            Ok(payment)
        } else {
            let error = parse_gateway_error(&body);
            Err(anyhow!(
                "Failed to fetch Razorpay payment: {} - {}",
                error.error.code,
                error.error.description
            ))
        }
    }

    /// Issue a refund against a captured payment.
    pub async fn refund_payment(
        &self,
        payment_id: &str,
        amount: u64,
        notes: Option<serde_json::Value>,
    ) -> Result<RefundEntity> {
        if !self.is_configured() {
            return Err(anyhow!("Razorpay credentials not configured"));
        }

        let url = format!(
            "{}/payments/{}/refund",
            self.config.api_base_url, payment_id
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&serde_json::json!({ "amount": amount, "notes": notes }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let refund: RefundEntity = serde_json::from_str(&body)?;
            tracing::info!(
                refund_id = %refund.id,
                payment_id = %payment_id,
                amount = amount,
                "Razorpay refund created"
            );
            Ok(refund)
        } else {
            let error = parse_gateway_error(&body);
            Err(anyhow!(
                "Razorpay refund failed: {} - {}",
                error.error.code,
                error.error.description
            ))
        }
    }

    /// Verify payment signature from Razorpay checkout.
    ///
    /// The signature is computed as:
    /// `HMAC-SHA256(order_id + "|" + payment_id, key_secret)`
    pub fn verify_payment_signature(&self, verification: &PaymentVerification) -> Result<bool> {
        let payload = format!(
            "{}|{}",
            verification.razorpay_order_id, verification.razorpay_payment_id
        );

        let expected_signature =
            compute_signature(&payload, self.config.key_secret.expose_secret())?;

        Ok(constant_time_eq(
            &expected_signature,
            &verification.razorpay_signature,
        ))
    }

    /// Verify webhook signature over the raw request body.
    ///
    /// The signature is computed as:
    /// `HMAC-SHA256(request_body, webhook_secret)`
    pub fn verify_webhook_signature(&self, body: &str, signature: &str) -> Result<bool> {
        let expected_signature =
            compute_signature(body, self.config.webhook_secret.expose_secret())?;

        Ok(constant_time_eq(&expected_signature, signature))
    }

    /// Parse webhook event from request body.
    pub fn parse_webhook_event(&self, body: &str) -> Result<WebhookEvent> {
        let event: WebhookEvent = serde_json::from_str(body)?;
        Ok(event)
    }
}

fn parse_gateway_error(body: &str) -> RazorpayError {
    serde_json::from_str(body).unwrap_or_else(|_| RazorpayError {
        error: RazorpayErrorDetail {
            code: "UNKNOWN".to_string(),
            description: body.to_string(),
            source: None,
            step: None,
            reason: None,
        },
    })
}

/// Compute HMAC-SHA256 signature, hex-encoded.
fn compute_signature(payload: &str, secret: &str) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| anyhow!("Invalid key length"))?;
    mac.update(payload.as_bytes());
    let result = mac.finalize();
    Ok(hex::encode(result.into_bytes()))
}

fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}

/// Compute a checkout-style signature; test-support for exercising the
/// verification path with valid signatures.
pub fn sign_checkout(order_id: &str, payment_id: &str, secret: &str) -> String {
    compute_signature(&format!("{}|{}", order_id, payment_id), secret)
        .expect("HMAC accepts any key length")
}

/// Compute a webhook-style signature over a raw body.
pub fn sign_webhook_body(body: &str, secret: &str) -> String {
    compute_signature(body, secret).expect("HMAC accepts any key length")
}
