//! Scheduled reconciliation sweeps.
//!
//! Each sweep is an idempotent scan: re-running one finds nothing new
//! to do. The scheduler owns the timers; the sweeps themselves are
//! plain async functions over the stores so they can be driven
//! directly in tests. Sweeps share the collections with live request
//! handling and never assume exclusive access.

use crate::config::JobsConfig;
use crate::error::AppError;
use crate::models::{plan, SubscriptionStatus};
use crate::services::activation::end_trial;
use crate::services::metrics;
use crate::services::notifier::Notifier;
use crate::services::store::SubscriptionStore;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;

const REMINDER_DAYS: [i64; 3] = [7, 3, 1];
const REMINDER_RESEND_SUPPRESSION_HOURS: i64 = 24;

/// Transition active subscriptions past their expiry date to expired.
pub async fn expire_overdue_subscriptions(
    store: &Arc<dyn SubscriptionStore>,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let overdue = store.expired_active(now).await?;
    let mut expired = 0;

    for mut subscription in overdue {
        subscription.status = SubscriptionStatus::Expired;
        subscription.auto_renew = false;
        subscription.updated_at = now;
        store.save(&subscription).await?;
        expired += 1;
        tracing::info!(
            user_id = %subscription.user_id,
            plan = %subscription.plan.as_str(),
            expired_at = ?subscription.expiry_date,
            "Subscription expired"
        );
    }

    Ok(expired)
}

/// Revert trials whose window has closed back to free-tier limits.
pub async fn revert_ended_trials(
    store: &Arc<dyn SubscriptionStore>,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let ended = store.ended_trials(now).await?;
    let mut reverted = 0;

    for mut subscription in ended {
        end_trial(&mut subscription, "trial expired", now);
        store.save(&subscription).await?;
        reverted += 1;
        tracing::info!(user_id = %subscription.user_id, "Trial expired, reverted to free");
    }

    Ok(reverted)
}

/// Reset credit ledgers and usage counters for the current calendar
/// month. Lockstep: driven by the month boundary, not per-user elapsed
/// time, so every subscriber resets together.
pub async fn reset_monthly_credits(
    store: &Arc<dyn SubscriptionStore>,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let month_start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);

    let due = store.needing_credit_reset(month_start).await?;
    let mut reset = 0;

    for mut subscription in due {
        let allotment = plan::monthly_credit_allotment(subscription.plan);
        subscription.reset_credits(allotment, now);
        store.save(&subscription).await?;
        reset += 1;
    }

    if reset > 0 {
        tracing::info!(count = reset, "Monthly credit allotments reset");
    }
    Ok(reset)
}

/// Notify subscribers whose plan expires in 7, 3, or 1 days. Sends are
/// best-effort; a reminder stamp suppresses re-sends within 24h.
pub async fn send_renewal_reminders(
    store: &Arc<dyn SubscriptionStore>,
    notifier: &Arc<dyn Notifier>,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let horizon = now + Duration::days(REMINDER_DAYS[0] + 1);
    let expiring = store.expiring_between(now, horizon).await?;
    let mut sent = 0;

    for mut subscription in expiring {
        let Some(expiry) = subscription.expiry_date else {
            continue;
        };
        let days_left = (expiry - now).num_days();
        if !REMINDER_DAYS.contains(&days_left) {
            continue;
        }
        let recently_reminded = subscription.last_renewal_reminder.is_some_and(|at| {
            now - at < Duration::hours(REMINDER_RESEND_SUPPRESSION_HOURS)
        });
        if recently_reminded {
            continue;
        }

        if let Err(e) = notifier
            .send_renewal_reminder(&subscription.user_id, subscription.plan, expiry, days_left)
            .await
        {
            tracing::warn!(
                user_id = %subscription.user_id,
                error = %e,
                "Renewal reminder dispatch failed; next sweep retries"
            );
            continue;
        }

        subscription.last_renewal_reminder = Some(now);
        subscription.updated_at = now;
        store.save(&subscription).await?;
        sent += 1;
    }

    Ok(sent)
}

/// Spawn the sweep timers. Returns the token that stops them.
pub fn spawn_scheduler(
    store: Arc<dyn SubscriptionStore>,
    notifier: Arc<dyn Notifier>,
    config: JobsConfig,
) -> CancellationToken {
    let shutdown = CancellationToken::new();
    if !config.enabled {
        tracing::info!("Reconciliation jobs disabled by configuration");
        return shutdown;
    }

    {
        let store = store.clone();
        let shutdown = shutdown.clone();
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(config.expiry_sweep_interval_secs));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        match expire_overdue_subscriptions(&store, now).await {
                            Ok(count) => metrics::record_sweep("expiry", count as u64),
                            Err(e) => tracing::error!(error = %e, "Expiry sweep failed"),
                        }
                        match revert_ended_trials(&store, now).await {
                            Ok(count) => metrics::record_sweep("trial_expiry", count as u64),
                            Err(e) => tracing::error!(error = %e, "Trial expiry sweep failed"),
                        }
                    }
                }
            }
        });
    }

    {
        let store = store.clone();
        let shutdown = shutdown.clone();
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(config.credit_reset_interval_secs));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match reset_monthly_credits(&store, Utc::now()).await {
                            Ok(count) => metrics::record_sweep("credit_reset", count as u64),
                            Err(e) => tracing::error!(error = %e, "Credit reset sweep failed"),
                        }
                    }
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(config.reminder_interval_secs));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match send_renewal_reminders(&store, &notifier, Utc::now()).await {
                            Ok(count) => metrics::record_sweep("renewal_reminder", count as u64),
                            Err(e) => tracing::error!(error = %e, "Reminder sweep failed"),
                        }
                    }
                }
            }
        });
    }

    shutdown
}
