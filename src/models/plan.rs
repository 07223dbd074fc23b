//! Plan catalog: tiers, billing cycles, and the price table.
//!
//! All monetary amounts are integers in the smallest currency unit
//! (paise for INR). Floating point never touches money.

use serde::{Deserialize, Serialize};

use super::subscription::CreditBalance;

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }

    /// Strict parse; unknown tiers are rejected, not defaulted.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(PlanTier::Free),
            "pro" => Some(PlanTier::Pro),
            "enterprise" => Some(PlanTier::Enterprise),
            _ => None,
        }
    }
}

/// Billing cycle for paid plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingCycle::Monthly),
            "annual" => Some(BillingCycle::Annual),
            _ => None,
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Annual => 12,
        }
    }

    /// Day-count basis used for proration. Fixed 30/365 approximation,
    /// not calendar-accurate.
    pub fn proration_days(&self) -> i64 {
        match self {
            BillingCycle::Monthly => PRORATION_DAYS_MONTHLY,
            BillingCycle::Annual => PRORATION_DAYS_ANNUAL,
        }
    }
}

pub const PRORATION_DAYS_MONTHLY: i64 = 30;
pub const PRORATION_DAYS_ANNUAL: i64 = 365;

/// Annual billing takes this off 12x the monthly price.
pub const ANNUAL_DISCOUNT_PERCENT: u64 = 20;

/// The gateway rejects orders below this amount (paise).
pub const MIN_ORDER_AMOUNT: u64 = 100;

pub const TRIAL_DAYS: i64 = 7;

/// Monthly list price per tier, in paise. Free has nothing to purchase.
pub fn monthly_price(plan: PlanTier) -> Option<u64> {
    match plan {
        PlanTier::Free => None,
        PlanTier::Pro => Some(49_900),
        PlanTier::Enterprise => Some(199_900),
    }
}

/// Undiscounted amount for a plan x cycle combination.
pub fn cycle_base_amount(plan: PlanTier, cycle: BillingCycle) -> Option<u64> {
    monthly_price(plan).map(|m| m * cycle.months() as u64)
}

/// List price actually charged for a full cycle (annual discount applied).
pub fn cycle_price(plan: PlanTier, cycle: BillingCycle) -> Option<u64> {
    let base = cycle_base_amount(plan, cycle)?;
    Some(match cycle {
        BillingCycle::Monthly => base,
        BillingCycle::Annual => apply_percent_discount(base, ANNUAL_DISCOUNT_PERCENT),
    })
}

/// Percentage off for a known discount code.
pub fn discount_code_percent(code: &str) -> Option<u64> {
    match code {
        "FEST25" => Some(25),
        "FOUNDER50" => Some(50),
        _ => None,
    }
}

/// Apply a percentage discount, rounding to the nearest paise.
pub fn apply_percent_discount(amount: u64, percent: u64) -> u64 {
    (amount * (100 - percent) + 50) / 100
}

/// Monthly AI-credit allotment per tier. Enterprise is unlimited,
/// expressed as a sentinel variant rather than a large number.
pub fn monthly_credit_allotment(plan: PlanTier) -> CreditBalance {
    match plan {
        PlanTier::Free => CreditBalance::metered(10),
        PlanTier::Pro => CreditBalance::metered(500),
        PlanTier::Enterprise => CreditBalance::Unlimited,
    }
}

pub fn resume_limit(plan: PlanTier) -> Option<u32> {
    match plan {
        PlanTier::Free => Some(3),
        PlanTier::Pro => Some(50),
        PlanTier::Enterprise => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annual_price_is_twelve_months_minus_twenty_percent() {
        let monthly = monthly_price(PlanTier::Pro).unwrap();
        let annual = cycle_price(PlanTier::Pro, BillingCycle::Annual).unwrap();
        assert_eq!(annual, (12 * monthly * 80 + 50) / 100);
        assert_eq!(annual, 479_040);
    }

    #[test]
    fn free_plan_has_no_price() {
        assert_eq!(cycle_price(PlanTier::Free, BillingCycle::Monthly), None);
        assert_eq!(cycle_price(PlanTier::Free, BillingCycle::Annual), None);
    }

    #[test]
    fn percent_discount_rounds_to_nearest() {
        // 33% off 101 = 67.67, rounds to 68
        assert_eq!(apply_percent_discount(101, 33), 68);
        assert_eq!(apply_percent_discount(100, 20), 80);
    }

    #[test]
    fn strict_parse_rejects_unknown_values() {
        assert_eq!(PlanTier::parse("premium"), None);
        assert_eq!(PlanTier::parse("pro"), Some(PlanTier::Pro));
        assert_eq!(BillingCycle::parse("weekly"), None);
        assert_eq!(BillingCycle::parse("annual"), Some(BillingCycle::Annual));
    }
}
