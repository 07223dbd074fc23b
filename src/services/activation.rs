//! Subscription activation service.
//!
//! The single owner of a user's subscription document. Plan and status
//! fields change only through the methods here; request handlers and
//! the webhook worker never write those fields directly.

use crate::error::AppError;
use crate::models::{
    plan, BillingCycle, CreditOutcome, PaymentStatus, PlanTier, Subscription, SubscriptionStatus,
    UsageCounters,
};
use crate::services::metrics;
use crate::services::store::{PaymentStore, StoreError, SubscriptionStore};
use anyhow::anyhow;
use chrono::{DateTime, Duration, Months, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;

/// Quote for a plan change. The actual change happens only after a new
/// payment record reaches `captured`, through the same pipeline as an
/// initial purchase.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeQuote {
    pub current_plan: PlanTier,
    pub new_plan: PlanTier,
    pub new_cycle: BillingCycle,
    pub full_price: u64,
    /// Unused value of the running cycle, credited against the charge.
    pub prorated_credit: u64,
    pub amount_due: u64,
    pub prorated: bool,
}

#[derive(Clone)]
pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionStore>,
    payments: Arc<dyn PaymentStore>,
}

fn generate_referral_code() -> String {
    let code: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    code.to_ascii_uppercase()
}

fn cycle_expiry(from: DateTime<Utc>, cycle: BillingCycle) -> DateTime<Utc> {
    from.checked_add_months(Months::new(cycle.months()))
        .unwrap_or(from + Duration::days(cycle.proration_days()))
}

impl SubscriptionService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        payments: Arc<dyn PaymentStore>,
    ) -> Self {
        Self {
            subscriptions,
            payments,
        }
    }

    /// Load the user's subscription, creating a free/active one on
    /// first access. Creation races resolve through the unique user id
    /// constraint: the loser re-reads the winner's document.
    pub async fn get_or_create(&self, user_id: &str) -> Result<Subscription, AppError> {
        if let Some(existing) = self.subscriptions.find_by_user(user_id).await? {
            return Ok(existing);
        }

        for _ in 0..3 {
            let fresh = Subscription::new_free(
                user_id.to_string(),
                generate_referral_code(),
                Utc::now(),
            );
            match self.subscriptions.insert(&fresh).await {
                Ok(()) => {
                    tracing::info!(user_id = %user_id, "Created free subscription on first access");
                    return Ok(fresh);
                }
                Err(StoreError::Duplicate) => {
                    // Either a concurrent creation for this user or a
                    // referral-code collision; re-read to find out.
                    if let Some(existing) = self.subscriptions.find_by_user(user_id).await? {
                        return Ok(existing);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::InternalError(anyhow!(
            "could not allocate a unique referral code"
        )))
    }

    /// Apply a captured payment to the owning subscription.
    ///
    /// Callers reach this only after winning the capture transition
    /// (idempotency guard + status CAS), so it runs once per payment.
    /// A non-captured record is a caller ordering bug and is refused.
    pub async fn activate_subscription(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Subscription, AppError> {
        let record = self
            .payments
            .find_by_payment_id(gateway_payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("payment record not found")))?;

        if record.status != PaymentStatus::Captured {
            return Err(AppError::Conflict(anyhow!(
                "payment is not captured (status: {})",
                record.status.as_str()
            )));
        }

        let mut subscription = self.get_or_create(&record.user_id).await?;
        let now = Utc::now();
        let expiry = cycle_expiry(now, record.billing_cycle);
        let from_plan = subscription.plan;

        subscription.plan = record.plan;
        subscription.billing_cycle = record.billing_cycle;
        subscription.status = SubscriptionStatus::Active;
        subscription.start_date = now;
        subscription.expiry_date = Some(expiry);
        subscription.next_billing_date = Some(expiry);
        subscription.auto_renew = true;
        subscription.is_trial = false;
        subscription.credits = plan::monthly_credit_allotment(record.plan);
        subscription.usage = UsageCounters::for_plan(record.plan);
        subscription.last_credit_reset = now;
        subscription.last_payment_at = Some(now);
        subscription.last_payment_amount = Some(record.amount);
        subscription.cancelled_at = None;
        subscription.cancellation_reason = None;
        subscription.append_upgrade_history(
            from_plan,
            record.plan,
            format!("payment {}", gateway_payment_id),
            now,
        );
        subscription.updated_at = now;

        self.subscriptions.save(&subscription).await?;

        metrics::record_subscription_event("activated");
        tracing::info!(
            user_id = %subscription.user_id,
            plan = %record.plan.as_str(),
            billing_cycle = %record.billing_cycle.as_str(),
            expiry = %expiry,
            payment_id = %gateway_payment_id,
            "Subscription activated"
        );

        Ok(subscription)
    }

    /// Cancel an active subscription. Access runs through the paid-for
    /// expiry date; only auto-renewal stops now.
    pub async fn cancel_subscription(
        &self,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<Subscription, AppError> {
        let mut subscription = self
            .subscriptions
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("subscription not found")))?;

        if subscription.status != SubscriptionStatus::Active {
            return Err(AppError::BadRequest(anyhow!(
                "no active subscription to cancel"
            )));
        }

        let now = Utc::now();
        subscription.status = SubscriptionStatus::Cancelled;
        subscription.cancelled_at = Some(now);
        subscription.cancellation_reason = reason;
        subscription.auto_renew = false;
        subscription.updated_at = now;

        self.subscriptions.save(&subscription).await?;

        metrics::record_subscription_event("cancelled");
        tracing::info!(
            user_id = %user_id,
            access_until = ?subscription.expiry_date,
            "Subscription cancelled"
        );

        Ok(subscription)
    }

    /// Quote a plan change. With time remaining on an active cycle the
    /// unused value is credited: `max(0, new_price - current_price *
    /// days_remaining / total_days)`, nearest-paise rounding on the
    /// credit, over the fixed 30/365 day-count basis.
    pub async fn upgrade_quote(
        &self,
        user_id: &str,
        new_plan: PlanTier,
        new_cycle: BillingCycle,
    ) -> Result<UpgradeQuote, AppError> {
        if new_plan == PlanTier::Free {
            return Err(AppError::BadRequest(anyhow!(
                "downgrade to free happens by cancelling, not purchasing"
            )));
        }
        let full_price = plan::cycle_price(new_plan, new_cycle)
            .ok_or_else(|| AppError::BadRequest(anyhow!("no price configured for plan")))?;

        let subscription = self.get_or_create(user_id).await?;
        let now = Utc::now();

        let prorated_credit = if subscription.status == SubscriptionStatus::Active {
            let total_days = subscription.billing_cycle.proration_days() as u64;
            // Calendar months can run a day past the 30/365 basis.
            let days_remaining = (subscription.days_remaining(now) as u64).min(total_days);
            if days_remaining > 0 {
                let current_price =
                    plan::cycle_price(subscription.plan, subscription.billing_cycle).unwrap_or(0);
                (current_price * days_remaining + total_days / 2) / total_days
            } else {
                0
            }
        } else {
            0
        };

        let amount_due = full_price.saturating_sub(prorated_credit);

        Ok(UpgradeQuote {
            current_plan: subscription.plan,
            new_plan,
            new_cycle,
            full_price,
            prorated_credit,
            amount_due,
            prorated: prorated_credit > 0,
        })
    }

    /// Start the one-per-user trial: pro-equivalent limits for 7 days.
    pub async fn start_trial(&self, user_id: &str) -> Result<Subscription, AppError> {
        let mut subscription = self.get_or_create(user_id).await?;

        if subscription.trial_used {
            return Err(AppError::BadRequest(anyhow!("trial already used")));
        }
        if subscription.plan != PlanTier::Free {
            return Err(AppError::BadRequest(anyhow!(
                "trial is only available on the free plan"
            )));
        }

        let now = Utc::now();
        subscription.is_trial = true;
        subscription.trial_used = true;
        subscription.trial_start = Some(now);
        subscription.trial_end = Some(now + Duration::days(plan::TRIAL_DAYS));
        subscription.status = SubscriptionStatus::Trial;
        subscription.plan = PlanTier::Pro;
        subscription.credits = plan::monthly_credit_allotment(PlanTier::Pro);
        subscription.usage = UsageCounters::for_plan(PlanTier::Pro);
        subscription.last_credit_reset = now;
        subscription.append_upgrade_history(PlanTier::Free, PlanTier::Pro, "trial started", now);
        subscription.updated_at = now;

        self.subscriptions.save(&subscription).await?;

        metrics::record_subscription_event("trial_started");
        tracing::info!(
            user_id = %user_id,
            trial_end = ?subscription.trial_end,
            "Trial started"
        );

        Ok(subscription)
    }

    /// Cancel a running trial, reverting to free-tier limits.
    pub async fn cancel_trial(&self, user_id: &str) -> Result<Subscription, AppError> {
        let mut subscription = self
            .subscriptions
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("subscription not found")))?;

        if subscription.status != SubscriptionStatus::Trial {
            return Err(AppError::BadRequest(anyhow!("no trial in progress")));
        }

        let now = Utc::now();
        end_trial(&mut subscription, "trial cancelled", now);
        self.subscriptions.save(&subscription).await?;

        metrics::record_subscription_event("trial_cancelled");
        tracing::info!(user_id = %user_id, "Trial cancelled");

        Ok(subscription)
    }

    /// Deduct AI credits, counting the use. Insufficient balance is a
    /// soft result so callers can surface it without error plumbing.
    pub async fn deduct_credits(
        &self,
        user_id: &str,
        amount: u32,
    ) -> Result<CreditOutcome, AppError> {
        let mut subscription = self.get_or_create(user_id).await?;
        let now = Utc::now();
        let outcome = subscription.deduct_credits(amount, now);
        if outcome.is_deducted() {
            subscription.usage.ai_analyses += 1;
            self.subscriptions.save(&subscription).await?;
        }
        Ok(outcome)
    }

    /// Spend accumulated referral credit against an order.
    pub async fn debit_referral_credit(
        &self,
        user_id: &str,
        amount: u64,
    ) -> Result<(), AppError> {
        let mut subscription = self
            .subscriptions
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("subscription not found")))?;
        subscription.referral_credit = subscription.referral_credit.saturating_sub(amount);
        subscription.updated_at = Utc::now();
        self.subscriptions.save(&subscription).await?;
        Ok(())
    }
}

/// Revert a trial to free-tier plan and limits. Shared by trial
/// cancellation and the expiry sweep; `trial_used` is never reset.
pub(crate) fn end_trial(subscription: &mut Subscription, reason: &str, now: DateTime<Utc>) {
    let from_plan = subscription.plan;
    subscription.is_trial = false;
    subscription.status = SubscriptionStatus::Active;
    subscription.plan = PlanTier::Free;
    subscription.credits = plan::monthly_credit_allotment(PlanTier::Free);
    subscription.usage = UsageCounters::for_plan(PlanTier::Free);
    subscription.last_credit_reset = now;
    subscription.append_upgrade_history(from_plan, PlanTier::Free, reason, now);
    subscription.updated_at = now;
}
