//! Durable stores for payment records and subscriptions.
//!
//! Both documents are updated via whole-document rewrites through
//! their transition methods; payment status changes go through a
//! compare-and-swap on the prior status so that concurrent delivery
//! (synchronous verification racing the webhook) applies each
//! financial side effect at most once.

use crate::error::AppError;
use crate::models::{PaymentRecord, PaymentStatus, Subscription, SubscriptionStatus};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson};
use mongodb::error::ErrorKind;
use mongodb::options::{FindOptions, IndexOptions, ReplaceOptions};
use mongodb::{Collection, Database, IndexModel};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key")]
    Duplicate,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        if is_duplicate_key(&err) {
            StoreError::Duplicate
        } else {
            StoreError::Backend(anyhow::Error::new(err))
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => AppError::Conflict(anyhow!("duplicate key")),
            StoreError::Backend(e) => AppError::DatabaseError(e),
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match &*err.kind {
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::BulkWrite(bwe) => bwe
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|we| we.code == 11000)),
        _ => false,
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert(&self, record: &PaymentRecord) -> Result<(), StoreError>;

    async fn find_by_order_id(&self, order_id: &str)
        -> Result<Option<PaymentRecord>, StoreError>;

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>, StoreError>;

    /// Replace the document only if its stored status still equals
    /// `expected`. Returns whether the swap applied; a `false` means
    /// another path won the transition.
    async fn persist_transition(
        &self,
        record: &PaymentRecord,
        expected: PaymentStatus,
    ) -> Result<bool, StoreError>;

    /// Unconditional rewrite for audit-field updates that do not move
    /// the lifecycle status.
    async fn save(&self, record: &PaymentRecord) -> Result<(), StoreError>;

    /// Records for a user, newest first.
    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: u64,
    ) -> Result<Vec<PaymentRecord>, StoreError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_user(&self, user_id: &str) -> Result<Option<Subscription>, StoreError>;

    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError>;

    async fn save(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Active subscriptions whose expiry date has passed.
    async fn expired_active(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError>;

    /// Trials whose trial window has closed.
    async fn ended_trials(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError>;

    /// Active/trial subscriptions whose ledger was last reset before
    /// the current calendar month began.
    async fn needing_credit_reset(
        &self,
        month_start: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Active subscriptions expiring within the window.
    async fn expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError>;
}

/// Mongo-backed payment record store.
#[derive(Clone)]
pub struct MongoPaymentStore {
    collection: Collection<PaymentRecord>,
}

impl MongoPaymentStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("payments"),
        }
    }

    /// Unique order/payment id constraints are the backbone of the
    /// at-most-once guarantee; the rest serve the query paths.
    pub async fn init_indexes(&self) -> Result<(), StoreError> {
        let order_id_idx = IndexModel::builder()
            .keys(doc! { "gateway_order_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("gateway_order_id_unique_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let payment_id_idx = IndexModel::builder()
            .keys(doc! { "gateway_payment_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("gateway_payment_id_unique_idx".to_string())
                    .unique(true)
                    .sparse(true)
                    .build(),
            )
            .build();

        let user_status_idx = IndexModel::builder()
            .keys(doc! { "user_id": 1, "status": 1 })
            .options(
                IndexOptions::builder()
                    .name("user_status_idx".to_string())
                    .build(),
            )
            .build();

        let created_at_idx = IndexModel::builder()
            .keys(doc! { "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("created_at_desc_idx".to_string())
                    .build(),
            )
            .build();

        self.collection
            .create_indexes(
                [order_id_idx, payment_id_idx, user_status_idx, created_at_idx],
                None,
            )
            .await?;

        tracing::info!("Payment store indexes initialized");
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for MongoPaymentStore {
    async fn insert(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        self.collection.insert_one(record, None).await?;
        Ok(())
    }

    async fn find_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let filter = doc! { "gateway_order_id": order_id };
        Ok(self.collection.find_one(filter, None).await?)
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let filter = doc! { "gateway_payment_id": payment_id };
        Ok(self.collection.find_one(filter, None).await?)
    }

    async fn persist_transition(
        &self,
        record: &PaymentRecord,
        expected: PaymentStatus,
    ) -> Result<bool, StoreError> {
        let filter = doc! {
            "gateway_order_id": &record.gateway_order_id,
            "status": mongodb::bson::to_bson(&expected).map_err(anyhow::Error::new)?,
        };
        let result = self
            .collection
            .replace_one(filter, record, ReplaceOptions::default())
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn save(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        let filter = doc! { "gateway_order_id": &record.gateway_order_id };
        self.collection
            .replace_one(filter, record, ReplaceOptions::default())
            .await?;
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: u64,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        let filter = doc! { "user_id": user_id };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .skip(offset)
            .limit(limit)
            .build();

        let cursor = self.collection.find(filter, Some(options)).await?;
        let records: Vec<PaymentRecord> = cursor.try_collect().await.map_err(anyhow::Error::new)?;
        Ok(records)
    }
}

/// Mongo-backed subscription store.
#[derive(Clone)]
pub struct MongoSubscriptionStore {
    collection: Collection<Subscription>,
}

impl MongoSubscriptionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("subscriptions"),
        }
    }

    pub async fn init_indexes(&self) -> Result<(), StoreError> {
        let user_idx = IndexModel::builder()
            .keys(doc! { "user_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("user_id_unique_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let referral_idx = IndexModel::builder()
            .keys(doc! { "referral_code": 1 })
            .options(
                IndexOptions::builder()
                    .name("referral_code_unique_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let status_expiry_idx = IndexModel::builder()
            .keys(doc! { "status": 1, "expiry_date": 1 })
            .options(
                IndexOptions::builder()
                    .name("status_expiry_idx".to_string())
                    .build(),
            )
            .build();

        self.collection
            .create_indexes([user_idx, referral_idx, status_expiry_idx], None)
            .await?;

        tracing::info!("Subscription store indexes initialized");
        Ok(())
    }

    async fn find_all(&self, filter: mongodb::bson::Document) -> Result<Vec<Subscription>, StoreError> {
        let cursor = self.collection.find(filter, None).await?;
        let subs: Vec<Subscription> = cursor.try_collect().await.map_err(anyhow::Error::new)?;
        Ok(subs)
    }
}

fn status_bson(status: SubscriptionStatus) -> Bson {
    Bson::String(status.as_str().to_string())
}

#[async_trait]
impl SubscriptionStore for MongoSubscriptionStore {
    async fn find_by_user(&self, user_id: &str) -> Result<Option<Subscription>, StoreError> {
        let filter = doc! { "user_id": user_id };
        Ok(self.collection.find_one(filter, None).await?)
    }

    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.collection.insert_one(subscription, None).await?;
        Ok(())
    }

    async fn save(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let filter = doc! { "user_id": &subscription.user_id };
        self.collection
            .replace_one(filter, subscription, ReplaceOptions::default())
            .await?;
        Ok(())
    }

    async fn expired_active(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        self.find_all(doc! {
            "status": status_bson(SubscriptionStatus::Active),
            "expiry_date": { "$lt": mongodb::bson::DateTime::from_chrono(now) },
        })
        .await
    }

    async fn ended_trials(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        self.find_all(doc! {
            "status": status_bson(SubscriptionStatus::Trial),
            "trial_end": { "$lt": mongodb::bson::DateTime::from_chrono(now) },
        })
        .await
    }

    async fn needing_credit_reset(
        &self,
        month_start: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.find_all(doc! {
            "status": { "$in": [
                status_bson(SubscriptionStatus::Active),
                status_bson(SubscriptionStatus::Trial),
            ] },
            "last_credit_reset": { "$lt": mongodb::bson::DateTime::from_chrono(month_start) },
        })
        .await
    }

    async fn expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.find_all(doc! {
            "status": status_bson(SubscriptionStatus::Active),
            "expiry_date": {
                "$gte": mongodb::bson::DateTime::from_chrono(from),
                "$lte": mongodb::bson::DateTime::from_chrono(to),
            },
        })
        .await
    }
}
