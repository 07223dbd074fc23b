//! Subscription and payment REST handlers.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::models::{
    BillingCycle, CreditBalance, PaymentRecord, PaymentStatus, PlanTier, RequestMetadata,
    Subscription, SubscriptionStatus, UsageCounters,
};
use crate::services::activation::UpgradeQuote;
use crate::services::orders::{OrderQuote, VerifyPaymentArgs};
use crate::services::store::PaymentStore;
use crate::AppState;

/// Request to create a gateway order for a plan purchase.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1))]
    pub plan: String,
    #[validate(length(min = 1))]
    pub billing_cycle: String,
    pub discount_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    /// Gateway order id; the frontend checkout opens against this.
    pub order_id: String,
    pub amount: u64,
    pub currency: String,
    /// Internal payment record id.
    pub payment_id: Uuid,
    /// Razorpay key id for frontend initialization.
    pub key: String,
    pub receipt: String,
    pub plan_details: OrderQuote,
}

/// Payment confirmation submitted by the client after checkout.
#[derive(Debug, Deserialize, Validate)]
pub struct VerifyPaymentRequest {
    #[validate(length(min = 1))]
    pub razorpay_order_id: String,
    #[validate(length(min = 1))]
    pub razorpay_payment_id: String,
    #[validate(length(min = 1))]
    pub razorpay_signature: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub success: bool,
    pub is_duplicate: bool,
    pub payment: PaymentResponse,
    pub subscription: SubscriptionResponse,
}

#[derive(Debug, Deserialize)]
pub struct CancelSubscriptionRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpgradeRequest {
    #[validate(length(min = 1))]
    pub plan: String,
    #[validate(length(min = 1))]
    pub billing_cycle: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
    pub offset: Option<u64>,
}

/// Payment record as exposed to the account owner.
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub order_id: String,
    pub payment_id: Option<String>,
    pub plan: PlanTier,
    pub billing_cycle: BillingCycle,
    pub amount: u64,
    pub currency: String,
    pub status: PaymentStatus,
    pub receipt: String,
    pub created_at: String,
}

impl From<PaymentRecord> for PaymentResponse {
    fn from(record: PaymentRecord) -> Self {
        Self {
            id: record.id,
            order_id: record.gateway_order_id,
            payment_id: record.gateway_payment_id,
            plan: record.plan,
            billing_cycle: record.billing_cycle,
            amount: record.amount,
            currency: record.currency,
            status: record.status,
            receipt: record.receipt,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub start_date: String,
    pub expiry_date: Option<String>,
    pub next_billing_date: Option<String>,
    pub auto_renew: bool,
    pub is_trial: bool,
    pub trial_end: Option<String>,
    pub trial_used: bool,
    pub credits: CreditBalance,
    pub usage: UsageCounters,
    pub referral_code: String,
}

fn rfc3339(date: Option<DateTime<Utc>>) -> Option<String> {
    date.map(|d| d.to_rfc3339())
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        Self {
            plan: sub.plan,
            status: sub.status,
            billing_cycle: sub.billing_cycle,
            start_date: sub.start_date.to_rfc3339(),
            expiry_date: rfc3339(sub.expiry_date),
            next_billing_date: rfc3339(sub.next_billing_date),
            auto_renew: sub.auto_renew,
            is_trial: sub.is_trial,
            trial_end: rfc3339(sub.trial_end),
            trial_used: sub.trial_used,
            credits: sub.credits,
            usage: sub.usage,
            referral_code: sub.referral_code,
        }
    }
}

fn request_metadata(headers: &HeaderMap) -> RequestMetadata {
    RequestMetadata {
        ip: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string()),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
    }
}

fn parse_plan(plan: &str) -> Result<PlanTier, AppError> {
    PlanTier::parse(plan)
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("invalid plan: {}", plan)))
}

fn parse_cycle(cycle: &str) -> Result<BillingCycle, AppError> {
    BillingCycle::parse(cycle)
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("invalid billing cycle: {}", cycle)))
}

/// Create a gateway order for a plan purchase.
pub async fn create_order(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), AppError> {
    payload.validate()?;
    let tier = parse_plan(&payload.plan)?;
    let cycle = parse_cycle(&payload.billing_cycle)?;

    let created = state
        .orders
        .create_order(
            &auth.user_id,
            tier,
            cycle,
            payload.discount_code.as_deref(),
            request_metadata(&headers),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order_id: created.record.gateway_order_id.clone(),
            amount: created.record.amount,
            currency: created.record.currency.clone(),
            payment_id: created.record.id,
            key: state.razorpay.key_id().to_string(),
            receipt: created.record.receipt.clone(),
            plan_details: created.quote,
        }),
    ))
}

/// Verify a checkout confirmation and activate the subscription.
pub async fn verify_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Json<VerifyPaymentResponse>, AppError> {
    payload.validate()?;

    // Ownership gate before any processing: another user's order id
    // gets the same response as an order that does not exist.
    if let Some(record) = state
        .payments
        .find_by_order_id(&payload.razorpay_order_id)
        .await?
    {
        if record.user_id != auth.user_id {
            tracing::warn!(
                security_alert = "cross_user_verification",
                order_id = %record.gateway_order_id,
                caller = %auth.user_id,
                "Verification attempted against another user's order"
            );
            return Err(AppError::NotFound(anyhow::anyhow!(
                "payment record not found"
            )));
        }
    }

    let outcome = state
        .orders
        .verify_payment(VerifyPaymentArgs {
            razorpay_order_id: payload.razorpay_order_id,
            razorpay_payment_id: payload.razorpay_payment_id,
            razorpay_signature: payload.razorpay_signature,
        })
        .await?;

    let subscription = if outcome.is_duplicate {
        state.activation.get_or_create(&auth.user_id).await?
    } else {
        let payment_id = outcome
            .payment
            .gateway_payment_id
            .clone()
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("captured without id")))?;
        state.activation.activate_subscription(&payment_id).await?
    };

    Ok(Json(VerifyPaymentResponse {
        success: true,
        is_duplicate: outcome.is_duplicate,
        payment: outcome.payment.into(),
        subscription: subscription.into(),
    }))
}

/// Current subscription, created lazily on first access.
pub async fn get_subscription(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state.activation.get_or_create(&auth.user_id).await?;
    Ok(Json(subscription.into()))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<CancelSubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state
        .activation
        .cancel_subscription(&auth.user_id, payload.reason)
        .await?;
    Ok(Json(subscription.into()))
}

/// Quote a plan change. The plan itself changes only after the new
/// order is paid and captured.
pub async fn upgrade_subscription(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<UpgradeRequest>,
) -> Result<Json<UpgradeQuote>, AppError> {
    payload.validate()?;
    let tier = parse_plan(&payload.plan)?;
    let cycle = parse_cycle(&payload.billing_cycle)?;

    let quote = state
        .activation
        .upgrade_quote(&auth.user_id, tier, cycle)
        .await?;
    Ok(Json(quote))
}

pub async fn start_trial(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state.activation.start_trial(&auth.user_id).await?;
    Ok(Json(subscription.into()))
}

pub async fn cancel_trial(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state.activation.cancel_trial(&auth.user_id).await?;
    Ok(Json(subscription.into()))
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub credits: CreditBalance,
    pub usage: UsageCounters,
    pub last_credit_reset: String,
}

pub async fn get_usage(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<UsageResponse>, AppError> {
    let subscription = state.activation.get_or_create(&auth.user_id).await?;
    Ok(Json(UsageResponse {
        plan: subscription.plan,
        status: subscription.status,
        credits: subscription.credits,
        usage: subscription.usage,
        last_credit_reset: subscription.last_credit_reset.to_rfc3339(),
    }))
}

#[derive(Debug, Serialize)]
pub struct BillingHistoryResponse {
    pub payments: Vec<PaymentResponse>,
}

/// Payment records for the authenticated user, newest first.
pub async fn billing_history(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<HistoryParams>,
) -> Result<Json<BillingHistoryResponse>, AppError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = params.offset.unwrap_or(0);

    let records = state
        .payments
        .list_for_user(&auth.user_id, limit, offset)
        .await?;

    Ok(Json(BillingHistoryResponse {
        payments: records.into_iter().map(PaymentResponse::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ReferralCodeResponse {
    pub referral_code: String,
    pub referral_credit: u64,
    pub referral_count: u32,
}

pub async fn referral_code(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ReferralCodeResponse>, AppError> {
    let subscription = state.activation.get_or_create(&auth.user_id).await?;
    Ok(Json(ReferralCodeResponse {
        referral_code: subscription.referral_code,
        referral_credit: subscription.referral_credit,
        referral_count: subscription.referral_count,
    }))
}
