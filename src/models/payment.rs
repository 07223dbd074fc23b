//! Payment record: one document per purchase attempt.
//!
//! Records are never deleted (financial audit trail) and change state
//! only through the transition methods below, which keep the audit
//! fields consistent with the lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::plan::{BillingCycle, PlanTier};

/// Machine-readable failure codes for security-relevant rejections.
pub const SIGNATURE_VERIFICATION_FAILED: &str = "SIGNATURE_VERIFICATION_FAILED";
pub const AMOUNT_MISMATCH: &str = "AMOUNT_MISMATCH";
pub const ORDER_ID_MISMATCH: &str = "ORDER_ID_MISMATCH";
pub const GATEWAY_FAILURE: &str = "GATEWAY_FAILURE";

/// Payment attempt lifecycle.
///
/// `created -> pending -> {authorized, failed}; authorized -> captured;
/// {authorized, captured} -> refunded`. The synchronous verification
/// path may capture straight from `created` when the gateway never
/// reported an intermediate state to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Pending,
    Authorized,
    Captured,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Terminal success states: financial side effects already applied.
    pub fn is_processed(&self) -> bool {
        matches!(self, PaymentStatus::Captured | PaymentStatus::Authorized)
    }
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid payment transition from {from} to {to}")]
    Invalid { from: &'static str, to: &'static str },
    #[error("gateway payment id already set to a different value")]
    PaymentIdConflict,
}

/// Structured failure detail, mirroring the gateway's error shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub code: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PaymentFailure {
    pub fn new(code: &str, description: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            description: description.into(),
            source: None,
            step: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundDetail {
    pub refund_id: String,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub refunded_at: DateTime<Utc>,
}

/// Request provenance captured at order creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub user_id: String,
    pub subscription_id: Uuid,
    pub plan: PlanTier,
    pub billing_cycle: BillingCycle,

    /// Globally unique, immutable once set.
    pub gateway_order_id: String,
    /// Set at most once, on transition into authorized/captured.
    pub gateway_payment_id: Option<String>,
    pub gateway_signature: Option<String>,
    pub invoice_id: Option<String>,
    pub receipt: String,

    /// Final charged amount in paise.
    pub amount: u64,
    pub currency: String,
    pub base_amount: u64,
    pub discount_amount: u64,
    pub discount_code: Option<String>,
    pub referral_credit_applied: u64,

    pub status: PaymentStatus,
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<PaymentFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundDetail>,

    pub attempts: u32,
    pub webhook_received: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub webhook_received_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub captured_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: RequestMetadata,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

pub struct NewPaymentRecord {
    pub user_id: String,
    pub subscription_id: Uuid,
    pub plan: PlanTier,
    pub billing_cycle: BillingCycle,
    pub gateway_order_id: String,
    pub receipt: String,
    pub amount: u64,
    pub currency: String,
    pub base_amount: u64,
    pub discount_amount: u64,
    pub discount_code: Option<String>,
    pub referral_credit_applied: u64,
    pub metadata: RequestMetadata,
}

impl PaymentRecord {
    pub fn new(input: NewPaymentRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: input.user_id,
            subscription_id: input.subscription_id,
            plan: input.plan,
            billing_cycle: input.billing_cycle,
            gateway_order_id: input.gateway_order_id,
            gateway_payment_id: None,
            gateway_signature: None,
            invoice_id: None,
            receipt: input.receipt,
            amount: input.amount,
            currency: input.currency,
            base_amount: input.base_amount,
            discount_amount: input.discount_amount,
            discount_code: input.discount_code,
            referral_credit_applied: input.referral_credit_applied,
            status: PaymentStatus::Created,
            method: None,
            failure: None,
            refund: None,
            attempts: 0,
            webhook_received: false,
            webhook_received_at: None,
            captured_at: None,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    fn set_payment_id(&mut self, payment_id: &str) -> Result<(), TransitionError> {
        match &self.gateway_payment_id {
            Some(existing) if existing != payment_id => Err(TransitionError::PaymentIdConflict),
            Some(_) => Ok(()),
            None => {
                self.gateway_payment_id = Some(payment_id.to_string());
                Ok(())
            }
        }
    }

    pub fn mark_pending(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            PaymentStatus::Created => {
                self.status = PaymentStatus::Pending;
                self.updated_at = now;
                Ok(())
            }
            other => Err(TransitionError::Invalid {
                from: other.as_str(),
                to: "pending",
            }),
        }
    }

    pub fn mark_authorized(
        &mut self,
        payment_id: &str,
        method: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        match self.status {
            PaymentStatus::Created | PaymentStatus::Pending => {
                self.set_payment_id(payment_id)?;
                self.status = PaymentStatus::Authorized;
                self.method = method.or(self.method.take());
                self.attempts += 1;
                self.updated_at = now;
                Ok(())
            }
            PaymentStatus::Authorized => self.set_payment_id(payment_id),
            other => Err(TransitionError::Invalid {
                from: other.as_str(),
                to: "authorized",
            }),
        }
    }

    pub fn mark_captured(
        &mut self,
        payment_id: &str,
        signature: Option<String>,
        method: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        match self.status {
            PaymentStatus::Created | PaymentStatus::Pending | PaymentStatus::Authorized => {
                self.set_payment_id(payment_id)?;
                self.status = PaymentStatus::Captured;
                self.gateway_signature = signature.or(self.gateway_signature.take());
                self.method = method.or(self.method.take());
                self.captured_at = Some(now);
                self.attempts += 1;
                self.updated_at = now;
                Ok(())
            }
            // Duplicate delivery converging on the same terminal state.
            PaymentStatus::Captured => self.set_payment_id(payment_id),
            other => Err(TransitionError::Invalid {
                from: other.as_str(),
                to: "captured",
            }),
        }
    }

    pub fn mark_failed(
        &mut self,
        failure: PaymentFailure,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        match self.status {
            PaymentStatus::Created | PaymentStatus::Pending | PaymentStatus::Authorized => {
                self.status = PaymentStatus::Failed;
                self.failure = Some(failure);
                self.attempts += 1;
                self.updated_at = now;
                Ok(())
            }
            other => Err(TransitionError::Invalid {
                from: other.as_str(),
                to: "failed",
            }),
        }
    }

    pub fn mark_refunded(
        &mut self,
        refund: RefundDetail,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        match self.status {
            PaymentStatus::Authorized | PaymentStatus::Captured => {
                self.status = PaymentStatus::Refunded;
                self.refund = Some(refund);
                self.updated_at = now;
                Ok(())
            }
            other => Err(TransitionError::Invalid {
                from: other.as_str(),
                to: "refunded",
            }),
        }
    }

    /// Stamp webhook receipt; safe to call on every delivery.
    pub fn record_webhook_receipt(&mut self, now: DateTime<Utc>) {
        if !self.webhook_received {
            self.webhook_received = true;
            self.webhook_received_at = Some(now);
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PaymentRecord {
        PaymentRecord::new(
            NewPaymentRecord {
                user_id: "user-1".to_string(),
                subscription_id: Uuid::new_v4(),
                plan: PlanTier::Pro,
                billing_cycle: BillingCycle::Monthly,
                gateway_order_id: "order_test_1".to_string(),
                receipt: "rcpt_pro_monthly_1_abc".to_string(),
                amount: 49_900,
                currency: "INR".to_string(),
                base_amount: 49_900,
                discount_amount: 0,
                discount_code: None,
                referral_credit_applied: 0,
                metadata: RequestMetadata::default(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn capture_from_created_sets_payment_id_once() {
        let mut rec = record();
        let now = Utc::now();
        rec.mark_captured("pay_1", Some("sig".to_string()), None, now)
            .unwrap();
        assert_eq!(rec.status, PaymentStatus::Captured);
        assert_eq!(rec.gateway_payment_id.as_deref(), Some("pay_1"));
        assert!(rec.captured_at.is_some());

        // Re-capture with the same payment id is a no-op.
        rec.mark_captured("pay_1", None, None, now).unwrap();
        assert_eq!(rec.status, PaymentStatus::Captured);

        // A different payment id on the same order is a conflict.
        let err = rec.mark_captured("pay_2", None, None, now).unwrap_err();
        assert!(matches!(err, TransitionError::PaymentIdConflict));
    }

    #[test]
    fn nominal_gateway_lifecycle_walks_every_state() {
        let mut rec = record();
        let now = Utc::now();
        rec.mark_pending(now).unwrap();
        assert_eq!(rec.status, PaymentStatus::Pending);
        // Pending cannot be re-entered.
        assert!(rec.mark_pending(now).is_err());

        rec.mark_authorized("pay_1", Some("upi".to_string()), now)
            .unwrap();
        assert_eq!(rec.status, PaymentStatus::Authorized);
        assert_eq!(rec.method.as_deref(), Some("upi"));

        rec.mark_captured("pay_1", None, None, now).unwrap();
        assert_eq!(rec.status, PaymentStatus::Captured);
    }

    #[test]
    fn failed_is_terminal() {
        let mut rec = record();
        let now = Utc::now();
        rec.mark_failed(PaymentFailure::new(AMOUNT_MISMATCH, "amount mismatch"), now)
            .unwrap();
        assert_eq!(rec.status, PaymentStatus::Failed);
        assert_eq!(rec.failure.as_ref().unwrap().code, AMOUNT_MISMATCH);

        assert!(rec.mark_captured("pay_1", None, None, now).is_err());
        assert!(rec.mark_pending(now).is_err());
    }

    #[test]
    fn refund_requires_prior_success() {
        let mut rec = record();
        let now = Utc::now();
        let refund = RefundDetail {
            refund_id: "rfnd_1".to_string(),
            amount: 49_900,
            reason: None,
            refunded_at: now,
        };
        assert!(rec.mark_refunded(refund.clone(), now).is_err());

        rec.mark_captured("pay_1", None, None, now).unwrap();
        rec.mark_refunded(refund, now).unwrap();
        assert_eq!(rec.status, PaymentStatus::Refunded);
        assert_eq!(rec.refund.as_ref().unwrap().amount, 49_900);
    }

    #[test]
    fn captured_record_cannot_fail() {
        let mut rec = record();
        let now = Utc::now();
        rec.mark_captured("pay_1", None, None, now).unwrap();
        assert!(rec
            .mark_failed(PaymentFailure::new(GATEWAY_FAILURE, "late failure"), now)
            .is_err());
    }
}
