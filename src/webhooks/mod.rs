//! Deferred webhook processing.
//!
//! The HTTP handler verifies the gateway signature, acknowledges
//! immediately, and enqueues the event here. A background worker
//! applies the event with the same idempotency guard and cross-checks
//! as the synchronous verification path, so the two paths can run in
//! either order (or concurrently) and converge on one terminal state.

use crate::error::AppError;
use crate::models::payment::{PaymentFailure, AMOUNT_MISMATCH};
use crate::models::{PaymentStatus, RefundDetail};
use crate::services::activation::SubscriptionService;
use crate::services::metrics;
use crate::services::razorpay::{PaymentEntity, RefundEntity, WebhookEvent, WebhookEventKind};
use crate::services::store::PaymentStore;
use anyhow::anyhow;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What processing an event amounted to. Duplicates and unknown types
/// are normal operation, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied,
    Duplicate,
    Ignored,
    MissingRecord,
}

impl ProcessOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Applied => "applied",
            ProcessOutcome::Duplicate => "duplicate",
            ProcessOutcome::Ignored => "ignored",
            ProcessOutcome::MissingRecord => "missing_record",
        }
    }
}

pub struct WebhookJob {
    pub event: WebhookEvent,
}

/// Applies verified webhook events to payment records and
/// subscriptions.
#[derive(Clone)]
pub struct WebhookProcessor {
    payments: Arc<dyn PaymentStore>,
    activation: SubscriptionService,
}

impl WebhookProcessor {
    pub fn new(payments: Arc<dyn PaymentStore>, activation: SubscriptionService) -> Self {
        Self {
            payments,
            activation,
        }
    }

    pub async fn handle_event(&self, event: &WebhookEvent) -> Result<ProcessOutcome, AppError> {
        let kind = WebhookEventKind::parse(&event.event);
        let outcome = match &kind {
            WebhookEventKind::PaymentCaptured
            | WebhookEventKind::OrderPaid
            | WebhookEventKind::SubscriptionCharged => {
                match event.payload.payment.as_ref() {
                    Some(payment) => self.process_capture(&payment.entity).await?,
                    None => {
                        tracing::warn!(
                            event = %event.event,
                            "Capture-class event without a payment entity"
                        );
                        ProcessOutcome::Ignored
                    }
                }
            }
            WebhookEventKind::PaymentAuthorized => match event.payload.payment.as_ref() {
                Some(payment) => self.process_authorization(&payment.entity).await?,
                None => {
                    tracing::warn!(event = %event.event, "Authorized event without a payment entity");
                    ProcessOutcome::Ignored
                }
            },
            WebhookEventKind::PaymentFailed => match event.payload.payment.as_ref() {
                Some(payment) => self.process_failure(&payment.entity).await?,
                None => {
                    tracing::warn!(event = %event.event, "Failed event without a payment entity");
                    ProcessOutcome::Ignored
                }
            },
            WebhookEventKind::RefundProcessed => match event.payload.refund.as_ref() {
                Some(refund) => self.process_refund(&refund.entity).await?,
                None => {
                    tracing::warn!(event = %event.event, "Refund event without a refund entity");
                    ProcessOutcome::Ignored
                }
            },
            WebhookEventKind::SubscriptionCancelled | WebhookEventKind::SubscriptionCompleted => {
                // No gateway-subscription linkage in the data model;
                // acknowledged for the audit trail only.
                tracing::info!(event = %event.event, "Gateway subscription event acknowledged");
                ProcessOutcome::Ignored
            }
            WebhookEventKind::Unknown(other) => {
                tracing::info!(event = %other, "Unhandled webhook event type");
                ProcessOutcome::Ignored
            }
        };

        metrics::record_webhook_event(kind.as_str(), outcome.as_str());
        tracing::info!(
            event = %event.event,
            outcome = %outcome.as_str(),
            "Webhook event processed"
        );
        Ok(outcome)
    }

    /// Apply a gateway-confirmed capture. The record's stored amount is
    /// cross-checked against the gateway's before any transition; the
    /// status CAS makes the capture (and the one activation behind it)
    /// at-most-once even against a racing checkout verification.
    async fn process_capture(&self, entity: &PaymentEntity) -> Result<ProcessOutcome, AppError> {
        let Some(order_id) = entity.order_id.as_deref() else {
            tracing::warn!(payment_id = %entity.id, "Captured payment without an order id");
            return Ok(ProcessOutcome::Ignored);
        };

        let Some(mut record) = self.payments.find_by_order_id(order_id).await? else {
            tracing::warn!(
                security_alert = "unknown_order",
                order_id = %order_id,
                payment_id = %entity.id,
                "Webhook references an order this service never created"
            );
            return Ok(ProcessOutcome::MissingRecord);
        };

        let now = Utc::now();
        record.record_webhook_receipt(now);

        match record.status {
            PaymentStatus::Captured | PaymentStatus::Refunded => {
                // Duplicate delivery; keep the receipt stamp for audit.
                self.payments.save(&record).await?;
                return Ok(ProcessOutcome::Duplicate);
            }
            PaymentStatus::Failed => {
                tracing::warn!(
                    order_id = %order_id,
                    payment_id = %entity.id,
                    "Capture reported for a record already marked failed"
                );
                self.payments.save(&record).await?;
                return Ok(ProcessOutcome::Ignored);
            }
            PaymentStatus::Created | PaymentStatus::Pending | PaymentStatus::Authorized => {}
        }

        let prior_status = record.status;

        if entity.amount != record.amount {
            tracing::warn!(
                security_alert = "amount_mismatch",
                order_id = %order_id,
                payment_id = %entity.id,
                expected = record.amount,
                actual = entity.amount,
                "Webhook payment amount does not match order amount"
            );
            record
                .mark_failed(
                    PaymentFailure::new(AMOUNT_MISMATCH, "webhook amount does not match order"),
                    now,
                )
                .map_err(|e| AppError::Conflict(anyhow!(e)))?;
            self.payments.persist_transition(&record, prior_status).await?;
            metrics::record_payment_transition("failed");
            return Ok(ProcessOutcome::Ignored);
        }

        record
            .mark_captured(&entity.id, None, entity.method.clone(), now)
            .map_err(|e| AppError::Conflict(anyhow!(e)))?;

        let applied = self
            .payments
            .persist_transition(&record, prior_status)
            .await?;
        if !applied {
            tracing::info!(
                order_id = %order_id,
                "Capture already applied by a concurrent path"
            );
            return Ok(ProcessOutcome::Duplicate);
        }

        metrics::record_payment_transition("captured");

        // The capture is durable; activation must not be lost to a
        // transient store hiccup.
        let activation = self.activation.clone();
        let payment_id = entity.id.clone();
        retry(short_backoff(), || {
            let activation = activation.clone();
            let payment_id = payment_id.clone();
            async move {
                activation
                    .activate_subscription(&payment_id)
                    .await
                    .map_err(|e| match e {
                        AppError::DatabaseError(_) | AppError::ServiceUnavailable => {
                            backoff::Error::transient(e)
                        }
                        other => backoff::Error::permanent(other),
                    })
            }
        })
        .await?;

        tracing::info!(
            order_id = %order_id,
            payment_id = %entity.id,
            amount = entity.amount,
            "Payment captured via webhook"
        );
        Ok(ProcessOutcome::Applied)
    }

    async fn process_authorization(
        &self,
        entity: &PaymentEntity,
    ) -> Result<ProcessOutcome, AppError> {
        let Some(order_id) = entity.order_id.as_deref() else {
            tracing::warn!(payment_id = %entity.id, "Authorized payment without an order id");
            return Ok(ProcessOutcome::Ignored);
        };

        let Some(mut record) = self.payments.find_by_order_id(order_id).await? else {
            tracing::warn!(order_id = %order_id, "Authorization for an unknown order");
            return Ok(ProcessOutcome::MissingRecord);
        };

        let now = Utc::now();
        record.record_webhook_receipt(now);

        match record.status {
            PaymentStatus::Created | PaymentStatus::Pending => {
                let prior_status = record.status;
                record
                    .mark_authorized(&entity.id, entity.method.clone(), now)
                    .map_err(|e| AppError::Conflict(anyhow!(e)))?;
                let applied = self
                    .payments
                    .persist_transition(&record, prior_status)
                    .await?;
                if applied {
                    metrics::record_payment_transition("authorized");
                    Ok(ProcessOutcome::Applied)
                } else {
                    Ok(ProcessOutcome::Duplicate)
                }
            }
            _ => {
                self.payments.save(&record).await?;
                Ok(ProcessOutcome::Duplicate)
            }
        }
    }

    async fn process_failure(&self, entity: &PaymentEntity) -> Result<ProcessOutcome, AppError> {
        let Some(order_id) = entity.order_id.as_deref() else {
            tracing::warn!(payment_id = %entity.id, "Failed payment without an order id");
            return Ok(ProcessOutcome::Ignored);
        };

        let Some(mut record) = self.payments.find_by_order_id(order_id).await? else {
            tracing::warn!(order_id = %order_id, "Failure for an unknown order");
            return Ok(ProcessOutcome::MissingRecord);
        };

        let now = Utc::now();
        record.record_webhook_receipt(now);

        match record.status {
            PaymentStatus::Created | PaymentStatus::Pending | PaymentStatus::Authorized => {
                let prior_status = record.status;
                let failure = PaymentFailure {
                    code: entity
                        .error_code
                        .clone()
                        .unwrap_or_else(|| "PAYMENT_FAILED".to_string()),
                    description: entity
                        .error_description
                        .clone()
                        .unwrap_or_else(|| "payment failed at gateway".to_string()),
                    source: entity.error_source.clone(),
                    step: entity.error_step.clone(),
                    reason: entity.error_reason.clone(),
                };
                record
                    .mark_failed(failure, now)
                    .map_err(|e| AppError::Conflict(anyhow!(e)))?;
                let applied = self
                    .payments
                    .persist_transition(&record, prior_status)
                    .await?;
                if applied {
                    metrics::record_payment_transition("failed");
                    tracing::info!(
                        order_id = %order_id,
                        payment_id = %entity.id,
                        "Payment failed via webhook"
                    );
                    Ok(ProcessOutcome::Applied)
                } else {
                    Ok(ProcessOutcome::Duplicate)
                }
            }
            _ => {
                // A failure arriving after capture is gateway noise for
                // a different attempt on the same order.
                self.payments.save(&record).await?;
                Ok(ProcessOutcome::Duplicate)
            }
        }
    }

    async fn process_refund(&self, entity: &RefundEntity) -> Result<ProcessOutcome, AppError> {
        let Some(mut record) = self.payments.find_by_payment_id(&entity.payment_id).await? else {
            tracing::warn!(
                payment_id = %entity.payment_id,
                refund_id = %entity.id,
                "Refund for an unknown payment"
            );
            return Ok(ProcessOutcome::MissingRecord);
        };

        let now = Utc::now();
        record.record_webhook_receipt(now);

        match record.status {
            PaymentStatus::Authorized | PaymentStatus::Captured => {
                let prior_status = record.status;
                record
                    .mark_refunded(
                        RefundDetail {
                            refund_id: entity.id.clone(),
                            amount: entity.amount,
                            reason: entity
                                .notes
                                .as_ref()
                                .and_then(|n| n.get("reason"))
                                .and_then(|r| r.as_str())
                                .map(|r| r.to_string()),
                            refunded_at: now,
                        },
                        now,
                    )
                    .map_err(|e| AppError::Conflict(anyhow!(e)))?;
                let applied = self
                    .payments
                    .persist_transition(&record, prior_status)
                    .await?;
                if applied {
                    metrics::record_payment_transition("refunded");
                    tracing::info!(
                        payment_id = %entity.payment_id,
                        refund_id = %entity.id,
                        amount = entity.amount,
                        "Payment refunded via webhook"
                    );
                    Ok(ProcessOutcome::Applied)
                } else {
                    Ok(ProcessOutcome::Duplicate)
                }
            }
            PaymentStatus::Refunded => {
                self.payments.save(&record).await?;
                Ok(ProcessOutcome::Duplicate)
            }
            other => {
                tracing::warn!(
                    payment_id = %entity.payment_id,
                    status = %other.as_str(),
                    "Refund reported for a record with no prior success state"
                );
                self.payments.save(&record).await?;
                Ok(ProcessOutcome::Ignored)
            }
        }
    }
}

fn short_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..Default::default()
    }
}

/// Handle for enqueueing verified events onto the background worker.
#[derive(Clone)]
pub struct WebhookDispatcher {
    tx: mpsc::Sender<WebhookJob>,
    shutdown: CancellationToken,
}

impl WebhookDispatcher {
    /// Spawn the worker task and return the enqueue handle.
    pub fn spawn(processor: WebhookProcessor, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WebhookJob>(queue_size);
        let shutdown = CancellationToken::new();
        let worker_shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_shutdown.cancelled() => {
                        tracing::info!("Webhook worker shutting down");
                        break;
                    }
                    job = rx.recv() => {
                        match job {
                            Some(job) => process_job(&processor, job).await,
                            None => {
                                tracing::info!("Webhook queue closed, worker exiting");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self { tx, shutdown }
    }

    /// Enqueue an event. A full queue is reported to the caller but the
    /// gateway still gets its 200; its retry loop redelivers.
    pub fn dispatch(&self, job: WebhookJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Webhook queue full; relying on gateway redelivery");
                false
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Run one job to completion. Transient store failures retry with
/// exponential backoff; anything else is logged and dropped so the
/// worker never dies on a single event.
async fn process_job(processor: &WebhookProcessor, job: WebhookJob) {
    let event_name = job.event.event.clone();

    let result = retry(short_backoff(), || async {
        processor.handle_event(&job.event).await.map_err(|e| match e {
            AppError::DatabaseError(_) | AppError::ServiceUnavailable => {
                backoff::Error::transient(e)
            }
            other => backoff::Error::permanent(other),
        })
    })
    .await;

    match result {
        Ok(outcome) => {
            tracing::debug!(
                event = %event_name,
                outcome = ?outcome,
                "Webhook job finished"
            );
        }
        Err(e) => {
            metrics::record_webhook_event(&event_name, "error");
            tracing::error!(
                event = %event_name,
                error = %e,
                "Webhook job failed after retries"
            );
        }
    }
}
