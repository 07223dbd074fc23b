//! Razorpay webhook endpoint.
//!
//! The gateway enforces a short response budget and retries anything
//! that is not promptly acknowledged. The handler therefore does only
//! two things inline: verify the signature over the raw body, and
//! enqueue the event for the background worker. Everything after the
//! signature gate answers 200, even when processing cannot proceed;
//! a 400 means (and only means) the sender could not prove it is the
//! gateway.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};

use crate::error::AppError;
use crate::webhooks::WebhookJob;
use crate::AppState;

pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let Some(signature) = headers
        .get("X-Razorpay-Signature")
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!(
            security_alert = "missing_webhook_signature",
            "Webhook delivery without a signature header"
        );
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "missing webhook signature"
        )));
    };

    let is_valid = state
        .razorpay
        .verify_webhook_signature(&body, signature)
        .map_err(|e| {
            tracing::error!(error = %e, "Webhook signature computation error");
            AppError::InternalError(anyhow::anyhow!("webhook verification failed"))
        })?;

    if !is_valid {
        tracing::warn!(
            security_alert = "webhook_signature_mismatch",
            "Webhook signature verification failed"
        );
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "invalid webhook signature"
        )));
    }

    // Past this point the sender is the gateway. A payload we cannot
    // parse must still be acknowledged or the gateway will retry it
    // forever; log the anomaly and move on.
    let event = match state.razorpay.parse_webhook_event(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed webhook payload from verified sender");
            return Ok(StatusCode::OK);
        }
    };

    tracing::info!(
        event = %event.event,
        account_id = %event.account_id,
        "Webhook accepted, deferring processing"
    );

    state.webhooks.dispatch(WebhookJob { event });

    Ok(StatusCode::OK)
}
