//! Subscription document: one per user, long-lived, mutated in place
//! through the activation service only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::{self, BillingCycle, PlanTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Cancelled,
    Expired,
    Trial,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Trial => "trial",
        }
    }
}

/// AI-credit ledger. Enterprise is the `Unlimited` sentinel; metered
/// tiers maintain `remaining = total - used` through `deduct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CreditBalance {
    Unlimited,
    Metered { total: u32, used: u32, remaining: u32 },
}

impl CreditBalance {
    pub fn metered(total: u32) -> Self {
        CreditBalance::Metered {
            total,
            used: 0,
            remaining: total,
        }
    }

    pub fn remaining(&self) -> Option<u32> {
        match self {
            CreditBalance::Unlimited => None,
            CreditBalance::Metered { remaining, .. } => Some(*remaining),
        }
    }
}

/// Outcome of a credit deduction. Insufficient balance is a result,
/// not an error: callers degrade gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Deducted { remaining: Option<u32> },
    Insufficient { remaining: u32, requested: u32 },
}

impl CreditOutcome {
    pub fn is_deducted(&self) -> bool {
        matches!(self, CreditOutcome::Deducted { .. })
    }
}

/// Monthly usage counters, reset in lockstep with the credit ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounters {
    pub resumes_created: u32,
    pub resume_limit: Option<u32>,
    pub ai_analyses: u32,
    pub interview_sessions: u32,
    pub portfolios_generated: u32,
}

impl UsageCounters {
    pub fn for_plan(tier: PlanTier) -> Self {
        Self {
            resumes_created: 0,
            resume_limit: plan::resume_limit(tier),
            ai_analyses: 0,
            interview_sessions: 0,
            portfolios_generated: 0,
        }
    }

    pub fn reset_monthly(&mut self) {
        self.resumes_created = 0;
        self.ai_analyses = 0;
        self.interview_sessions = 0;
        self.portfolios_generated = 0;
    }
}

/// Append-only plan-change log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeHistoryEntry {
    pub from_plan: PlanTier,
    pub to_plan: PlanTier,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub changed_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "_id")]
    pub id: Uuid,
    /// Unique; a user has at most one subscription document.
    pub user_id: String,

    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub start_date: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub next_billing_date: Option<DateTime<Utc>>,
    pub auto_renew: bool,

    pub is_trial: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub trial_start: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub trial_end: Option<DateTime<Utc>>,
    /// One trial per user, ever. Never reset.
    pub trial_used: bool,

    pub credits: CreditBalance,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub last_credit_reset: DateTime<Utc>,
    pub usage: UsageCounters,

    /// Unique across all subscriptions.
    pub referral_code: String,
    pub referred_by: Option<String>,
    /// Accumulated referral credit in paise, spendable on orders.
    pub referral_credit: u64,
    pub referral_count: u32,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub last_payment_at: Option<DateTime<Utc>>,
    pub last_payment_amount: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::models::opt_chrono_datetime_as_bson_datetime"
    )]
    pub last_renewal_reminder: Option<DateTime<Utc>>,

    pub upgrade_history: Vec<UpgradeHistoryEntry>,

    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Fresh free-tier subscription, created lazily on first access.
    pub fn new_free(user_id: String, referral_code: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            plan: PlanTier::Free,
            status: SubscriptionStatus::Active,
            billing_cycle: BillingCycle::Monthly,
            start_date: now,
            expiry_date: None,
            next_billing_date: None,
            auto_renew: false,
            is_trial: false,
            trial_start: None,
            trial_end: None,
            trial_used: false,
            credits: plan::monthly_credit_allotment(PlanTier::Free),
            last_credit_reset: now,
            usage: UsageCounters::for_plan(PlanTier::Free),
            referral_code,
            referred_by: None,
            referral_credit: 0,
            referral_count: 0,
            last_payment_at: None,
            last_payment_amount: None,
            cancelled_at: None,
            cancellation_reason: None,
            last_renewal_reminder: None,
            upgrade_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Deduct AI credits. Unlimited plans bypass the ledger entirely;
    /// metered plans fail softly when the balance is short.
    pub fn deduct_credits(&mut self, amount: u32, now: DateTime<Utc>) -> CreditOutcome {
        match &mut self.credits {
            CreditBalance::Unlimited => CreditOutcome::Deducted { remaining: None },
            CreditBalance::Metered {
                total,
                used,
                remaining,
            } => {
                if amount > *remaining {
                    CreditOutcome::Insufficient {
                        remaining: *remaining,
                        requested: amount,
                    }
                } else {
                    *used += amount;
                    *remaining = *total - *used;
                    self.updated_at = now;
                    CreditOutcome::Deducted {
                        remaining: Some(*remaining),
                    }
                }
            }
        }
    }

    /// Replace the ledger with a fresh allotment and zero the monthly
    /// usage counters.
    pub fn reset_credits(&mut self, allotment: CreditBalance, now: DateTime<Utc>) {
        self.credits = allotment;
        self.usage.reset_monthly();
        self.last_credit_reset = now;
        self.updated_at = now;
    }

    pub fn append_upgrade_history(
        &mut self,
        from_plan: PlanTier,
        to_plan: PlanTier,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.upgrade_history.push(UpgradeHistoryEntry {
            from_plan,
            to_plan,
            changed_at: now,
            reason: reason.into(),
        });
    }

    /// Whole days until expiry, floored at zero.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        self.expiry_date
            .map(|expiry| (expiry - now).num_days().max(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub() -> Subscription {
        Subscription::new_free("user-1".to_string(), "REF12345".to_string(), Utc::now())
    }

    #[test]
    fn ledger_invariant_holds_across_deductions() {
        let mut s = sub();
        s.credits = CreditBalance::metered(10);
        let now = Utc::now();

        assert!(s.deduct_credits(4, now).is_deducted());
        assert!(s.deduct_credits(6, now).is_deducted());
        match s.credits {
            CreditBalance::Metered {
                total,
                used,
                remaining,
            } => {
                assert_eq!(used, 10);
                assert_eq!(remaining, total - used);
                assert_eq!(remaining, 0);
            }
            _ => panic!("expected metered ledger"),
        }
    }

    #[test]
    fn insufficient_deduction_leaves_ledger_unchanged() {
        let mut s = sub();
        s.credits = CreditBalance::metered(5);
        let now = Utc::now();

        assert!(s.deduct_credits(3, now).is_deducted());
        let outcome = s.deduct_credits(3, now);
        assert_eq!(
            outcome,
            CreditOutcome::Insufficient {
                remaining: 2,
                requested: 3
            }
        );
        assert_eq!(s.credits.remaining(), Some(2));
    }

    #[test]
    fn unlimited_plan_bypasses_ledger() {
        let mut s = sub();
        s.credits = CreditBalance::Unlimited;
        let now = Utc::now();

        for _ in 0..1000 {
            assert!(s.deduct_credits(u32::MAX, now).is_deducted());
        }
        assert_eq!(s.credits.remaining(), None);
    }

    #[test]
    fn days_remaining_floors_at_zero() {
        let now = Utc::now();
        let mut s = sub();
        s.expiry_date = Some(now - chrono::Duration::days(3));
        assert_eq!(s.days_remaining(now), 0);

        s.expiry_date = Some(now + chrono::Duration::days(30));
        assert_eq!(s.days_remaining(now), 30);
    }
}
