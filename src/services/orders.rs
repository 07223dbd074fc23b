//! Order creation and payment verification.
//!
//! Owns the purchase pipeline: price quoting, gateway order creation,
//! the payment record that mirrors it, and the verification gate that
//! turns a client-submitted confirmation into a captured record. The
//! idempotency guard lives here because every caller of the pipeline
//! (checkout confirmation and webhook alike) must consult it before
//! applying financial side effects.

use crate::error::AppError;
use crate::models::payment::{
    NewPaymentRecord, PaymentFailure, AMOUNT_MISMATCH, ORDER_ID_MISMATCH,
    SIGNATURE_VERIFICATION_FAILED,
};
use crate::models::{plan, BillingCycle, PaymentRecord, PaymentStatus, PlanTier, RequestMetadata};
use crate::services::activation::SubscriptionService;
use crate::services::metrics;
use crate::services::razorpay::{PaymentVerification, RazorpayClient};
use crate::services::store::PaymentStore;
use anyhow::anyhow;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;

/// Result of the idempotency guard for a gateway order id.
#[derive(Debug, Clone)]
pub struct IdempotencyCheck {
    pub exists: bool,
    /// True iff the record is already captured or authorized: the
    /// financial side effect has been applied and must not repeat.
    pub is_processed: bool,
    pub status: Option<PaymentStatus>,
}

/// Price breakdown for an order, all amounts in paise.
#[derive(Debug, Clone, Serialize)]
pub struct OrderQuote {
    pub plan: PlanTier,
    pub billing_cycle: BillingCycle,
    pub base_amount: u64,
    pub discount_percentage: u64,
    pub discount_amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_code: Option<String>,
    pub referral_credit_applied: u64,
    pub final_amount: u64,
}

/// A created order: the gateway order id lives on the record.
#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub record: PaymentRecord,
    pub quote: OrderQuote,
}

#[derive(Debug, Clone)]
pub struct VerifyPaymentArgs {
    pub razorpay_order_id: String,
    pub razorpay_payment_id: String,
    pub razorpay_signature: String,
}

/// Outcome of a successful verification call.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub payment: PaymentRecord,
    /// The order was already processed; no new side effects ran.
    pub is_duplicate: bool,
}

/// Compute the amount to charge for a plan purchase.
///
/// Annual billing takes 20% off twelve months; a discount code may do
/// better. The larger percentage wins, never both. Referral credit is
/// applied last, floored so the order stays chargeable.
pub fn quote_order(
    tier: PlanTier,
    cycle: BillingCycle,
    discount_code: Option<&str>,
    referral_credit: u64,
) -> Result<OrderQuote, AppError> {
    if tier == PlanTier::Free {
        return Err(AppError::BadRequest(anyhow!(
            "the free plan cannot be purchased"
        )));
    }

    let base_amount = plan::cycle_base_amount(tier, cycle)
        .ok_or_else(|| AppError::BadRequest(anyhow!("no price configured for plan")))?;

    let cycle_percent = match cycle {
        BillingCycle::Monthly => 0,
        BillingCycle::Annual => plan::ANNUAL_DISCOUNT_PERCENT,
    };

    let code_percent = match discount_code {
        Some(code) => plan::discount_code_percent(code)
            .ok_or_else(|| AppError::BadRequest(anyhow!("unknown discount code: {}", code)))?,
        None => 0,
    };

    let discount_percentage = cycle_percent.max(code_percent);
    let discounted = plan::apply_percent_discount(base_amount, discount_percentage);
    let discount_amount = base_amount - discounted;

    let referral_credit_applied = if discounted > plan::MIN_ORDER_AMOUNT {
        referral_credit.min(discounted - plan::MIN_ORDER_AMOUNT)
    } else {
        0
    };
    let final_amount = discounted - referral_credit_applied;

    Ok(OrderQuote {
        plan: tier,
        billing_cycle: cycle,
        base_amount,
        discount_percentage,
        discount_amount,
        discount_code: discount_code
            .filter(|_| code_percent == discount_percentage && code_percent > 0)
            .map(|c| c.to_string()),
        referral_credit_applied,
        final_amount,
    })
}

/// Receipt ids embed plan, cycle, and a millisecond timestamp; the
/// random suffix makes collisions negligible at any plausible volume.
fn generate_receipt(tier: PlanTier, cycle: BillingCycle) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!(
        "rcpt_{}_{}_{}_{}",
        tier.as_str(),
        cycle.as_str(),
        Utc::now().timestamp_millis(),
        suffix
    )
}

#[derive(Clone)]
pub struct OrderService {
    gateway: RazorpayClient,
    payments: Arc<dyn PaymentStore>,
    activation: SubscriptionService,
}

impl OrderService {
    pub fn new(
        gateway: RazorpayClient,
        payments: Arc<dyn PaymentStore>,
        activation: SubscriptionService,
    ) -> Self {
        Self {
            gateway,
            payments,
            activation,
        }
    }

    /// Has this order already been terminally processed? Consulted
    /// before any cross-cutting effect; combined with the unique order
    /// id constraint this is the sole at-most-once mechanism.
    pub async fn check_idempotency(&self, order_id: &str) -> Result<IdempotencyCheck, AppError> {
        let record = self.payments.find_by_order_id(order_id).await?;
        Ok(match record {
            Some(record) => IdempotencyCheck {
                exists: true,
                is_processed: record.status.is_processed(),
                status: Some(record.status),
            },
            None => IdempotencyCheck {
                exists: false,
                is_processed: false,
                status: None,
            },
        })
    }

    /// Create a gateway order for a plan purchase and persist the
    /// mirroring payment record before returning. The record must
    /// exist before any payment can be attempted against it.
    pub async fn create_order(
        &self,
        user_id: &str,
        tier: PlanTier,
        cycle: BillingCycle,
        discount_code: Option<&str>,
        metadata: RequestMetadata,
    ) -> Result<CreatedOrder, AppError> {
        if !self.gateway.is_configured() {
            tracing::error!("Razorpay credentials not configured; cannot create order");
            return Err(AppError::ServiceUnavailable);
        }

        let subscription = self.activation.get_or_create(user_id).await?;
        let quote = quote_order(tier, cycle, discount_code, subscription.referral_credit)?;
        let receipt = generate_receipt(tier, cycle);

        let notes = serde_json::json!({
            "user_id": user_id,
            "plan": tier.as_str(),
            "billing_cycle": cycle.as_str(),
        });

        let gateway_order = self
            .gateway
            .create_order(quote.final_amount, "INR", Some(receipt.clone()), Some(notes))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create Razorpay order");
                AppError::BadGateway(format!("failed to create payment order: {}", e))
            })?;

        let now = Utc::now();
        let record = PaymentRecord::new(
            NewPaymentRecord {
                user_id: user_id.to_string(),
                subscription_id: subscription.id,
                plan: tier,
                billing_cycle: cycle,
                gateway_order_id: gateway_order.id.clone(),
                receipt,
                amount: quote.final_amount,
                currency: gateway_order.currency.clone(),
                base_amount: quote.base_amount,
                discount_amount: quote.discount_amount,
                discount_code: quote.discount_code.clone(),
                referral_credit_applied: quote.referral_credit_applied,
                metadata,
            },
            now,
        );

        self.payments.insert(&record).await?;

        if quote.referral_credit_applied > 0 {
            self.activation
                .debit_referral_credit(user_id, quote.referral_credit_applied)
                .await?;
        }

        metrics::record_payment_transition("created");
        tracing::info!(
            user_id = %user_id,
            order_id = %record.gateway_order_id,
            amount = record.amount,
            plan = %tier.as_str(),
            billing_cycle = %cycle.as_str(),
            "Payment order created"
        );

        Ok(CreatedOrder { record, quote })
    }

    /// Verify a client-submitted payment confirmation.
    ///
    /// A sequential gate; each step short-circuits on failure. The
    /// gateway's view of the payment is authoritative: the client's
    /// claims about amount and status are never trusted.
    pub async fn verify_payment(
        &self,
        args: VerifyPaymentArgs,
    ) -> Result<VerificationOutcome, AppError> {
        if args.razorpay_order_id.is_empty()
            || args.razorpay_payment_id.is_empty()
            || args.razorpay_signature.is_empty()
        {
            return Err(AppError::BadRequest(anyhow!(
                "missing required payment verification parameters"
            )));
        }

        // An order id this system never issued is a potential forgery.
        let Some(mut record) = self
            .payments
            .find_by_order_id(&args.razorpay_order_id)
            .await?
        else {
            tracing::warn!(
                security_alert = "unknown_order",
                order_id = %args.razorpay_order_id,
                "Verification attempted against an order this service never created"
            );
            return Err(AppError::NotFound(anyhow!("payment record not found")));
        };

        // Cheap, safe early exit: already processed means the signature
        // and gateway state were validated by whichever path won.
        if record.status.is_processed() {
            tracing::info!(
                order_id = %record.gateway_order_id,
                status = %record.status.as_str(),
                "Duplicate verification request short-circuited"
            );
            return Ok(VerificationOutcome {
                payment: record,
                is_duplicate: true,
            });
        }

        let prior_status = record.status;
        let now = Utc::now();

        let verification = PaymentVerification {
            razorpay_order_id: args.razorpay_order_id.clone(),
            razorpay_payment_id: args.razorpay_payment_id.clone(),
            razorpay_signature: args.razorpay_signature.clone(),
        };
        let signature_valid = self
            .gateway
            .verify_payment_signature(&verification)
            .map_err(|e| {
                tracing::error!(error = %e, "Signature computation error");
                AppError::InternalError(anyhow!("signature verification failed"))
            })?;

        if !signature_valid {
            tracing::warn!(
                security_alert = "signature_mismatch",
                order_id = %record.gateway_order_id,
                payment_id = %args.razorpay_payment_id,
                "Payment signature verification failed"
            );
            self.fail_record(
                &mut record,
                prior_status,
                PaymentFailure::new(
                    SIGNATURE_VERIFICATION_FAILED,
                    "checkout signature did not match",
                ),
            )
            .await?;
            return Err(AppError::Unauthorized(anyhow!(
                "payment signature verification failed"
            )));
        }

        // Authoritative state, straight from the gateway. Unreachable
        // gateway is inconclusive: surface as transient, mark nothing.
        let gateway_payment = self
            .gateway
            .fetch_payment(&args.razorpay_payment_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    payment_id = %args.razorpay_payment_id,
                    "Failed to fetch payment from gateway"
                );
                AppError::ServiceUnavailable
            })?;

        if gateway_payment.amount != record.amount {
            tracing::warn!(
                security_alert = "amount_mismatch",
                order_id = %record.gateway_order_id,
                payment_id = %gateway_payment.id,
                expected = record.amount,
                actual = gateway_payment.amount,
                "Payment amount does not match order amount"
            );
            self.fail_record(
                &mut record,
                prior_status,
                PaymentFailure::new(AMOUNT_MISMATCH, "payment amount does not match order"),
            )
            .await?;
            return Err(AppError::BadRequest(anyhow!(
                "payment amount does not match"
            )));
        }

        if gateway_payment.order_id.as_deref() != Some(record.gateway_order_id.as_str()) {
            tracing::warn!(
                security_alert = "order_id_mismatch",
                order_id = %record.gateway_order_id,
                payment_id = %gateway_payment.id,
                expected = %record.gateway_order_id,
                actual = ?gateway_payment.order_id,
                "Gateway payment references a different order"
            );
            self.fail_record(
                &mut record,
                prior_status,
                PaymentFailure::new(ORDER_ID_MISMATCH, "payment does not belong to this order"),
            )
            .await?;
            return Err(AppError::BadRequest(anyhow!(
                "payment does not belong to this order"
            )));
        }

        // Transient gateway-side states are not fraud; reject without
        // marking the record failed so a later retry can succeed.
        if !matches!(gateway_payment.status.as_str(), "captured" | "authorized") {
            tracing::info!(
                order_id = %record.gateway_order_id,
                gateway_status = %gateway_payment.status,
                "Payment not yet capturable"
            );
            return Err(AppError::BadRequest(anyhow!(
                "payment is not captured yet (gateway status: {})",
                gateway_payment.status
            )));
        }

        record
            .mark_captured(
                &gateway_payment.id,
                Some(args.razorpay_signature),
                gateway_payment.method.clone(),
                now,
            )
            .map_err(|e| AppError::Conflict(anyhow!(e)))?;

        let applied = self
            .payments
            .persist_transition(&record, prior_status)
            .await?;
        if !applied {
            // The webhook path won the race; converge on its result.
            let stored = self
                .payments
                .find_by_order_id(&record.gateway_order_id)
                .await?
                .ok_or_else(|| AppError::NotFound(anyhow!("payment record not found")))?;
            tracing::info!(
                order_id = %stored.gateway_order_id,
                status = %stored.status.as_str(),
                "Concurrent capture detected; treating as duplicate"
            );
            return Ok(VerificationOutcome {
                payment: stored,
                is_duplicate: true,
            });
        }

        metrics::record_payment_transition("captured");
        tracing::info!(
            order_id = %record.gateway_order_id,
            payment_id = ?record.gateway_payment_id,
            amount = record.amount,
            "Payment captured via checkout verification"
        );

        Ok(VerificationOutcome {
            payment: record,
            is_duplicate: false,
        })
    }

    /// Mark a record failed, persisting through the status CAS. Losing
    /// the CAS means another path already moved the record; the
    /// rejection still stands, so only log it.
    async fn fail_record(
        &self,
        record: &mut PaymentRecord,
        prior_status: PaymentStatus,
        failure: PaymentFailure,
    ) -> Result<(), AppError> {
        let code = failure.code.clone();
        record
            .mark_failed(failure, Utc::now())
            .map_err(|e| AppError::Conflict(anyhow!(e)))?;
        let applied = self
            .payments
            .persist_transition(record, prior_status)
            .await?;
        if !applied {
            tracing::warn!(
                order_id = %record.gateway_order_id,
                code = %code,
                "Failed-state write lost a transition race; record left as stored"
            );
        } else {
            metrics::record_payment_transition("failed");
        }
        Ok(())
    }
}
