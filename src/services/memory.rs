//! In-memory store implementations.
//!
//! Back the integration tests and local development without a running
//! MongoDB. Semantics mirror the Mongo stores: unique keys reject
//! duplicates and payment transitions are compare-and-swap on the
//! prior status.

use super::store::{PaymentStore, StoreError, SubscriptionStore};
use crate::models::{PaymentRecord, PaymentStatus, Subscription, SubscriptionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Payment records keyed by gateway order id.
#[derive(Default)]
pub struct InMemoryPaymentStore {
    records: DashMap<String, PaymentRecord>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(record.gateway_order_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn find_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        Ok(self.records.get(order_id).map(|r| r.value().clone()))
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .find(|r| r.gateway_payment_id.as_deref() == Some(payment_id))
            .map(|r| r.value().clone()))
    }

    async fn persist_transition(
        &self,
        record: &PaymentRecord,
        expected: PaymentStatus,
    ) -> Result<bool, StoreError> {
        match self.records.get_mut(&record.gateway_order_id) {
            Some(mut stored) if stored.status == expected => {
                *stored = record.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn save(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        self.records
            .insert(record.gateway_order_id.clone(), record.clone());
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: u64,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        let mut records: Vec<PaymentRecord> = self
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .skip(offset as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

/// Subscriptions keyed by user id.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: DashMap<String, Subscription>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_where(&self, predicate: impl Fn(&Subscription) -> bool) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| predicate(s.value()))
            .map(|s| s.value().clone())
            .collect()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn find_by_user(&self, user_id: &str) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.get(user_id).map(|s| s.value().clone()))
    }

    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        let duplicate_code = self
            .subscriptions
            .iter()
            .any(|s| s.referral_code == subscription.referral_code);
        if duplicate_code {
            return Err(StoreError::Duplicate);
        }
        match self.subscriptions.entry(subscription.user_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(subscription.clone());
                Ok(())
            }
        }
    }

    async fn save(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.subscriptions
            .insert(subscription.user_id.clone(), subscription.clone());
        Ok(())
    }

    async fn expired_active(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.collect_where(|s| {
            s.status == SubscriptionStatus::Active
                && s.expiry_date.is_some_and(|expiry| expiry < now)
        }))
    }

    async fn ended_trials(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.collect_where(|s| {
            s.status == SubscriptionStatus::Trial && s.trial_end.is_some_and(|end| end < now)
        }))
    }

    async fn needing_credit_reset(
        &self,
        month_start: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.collect_where(|s| {
            matches!(
                s.status,
                SubscriptionStatus::Active | SubscriptionStatus::Trial
            ) && s.last_credit_reset < month_start
        }))
    }

    async fn expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.collect_where(|s| {
            s.status == SubscriptionStatus::Active
                && s.expiry_date
                    .is_some_and(|expiry| expiry >= from && expiry <= to)
        }))
    }
}
