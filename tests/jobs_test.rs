mod common;

use chrono::{Duration, Utc};
use common::{TestApp, TEST_USER};
use std::sync::Arc;
use subscription_service::jobs::{
    expire_overdue_subscriptions, reset_monthly_credits, revert_ended_trials,
    send_renewal_reminders,
};
use subscription_service::models::{
    BillingCycle, CreditBalance, PlanTier, SubscriptionStatus,
};
use subscription_service::services::notifier::Notifier;
use subscription_service::services::SubscriptionStore;

async fn seed_active(app: &TestApp, user: &str, expires_in_days: i64) {
    let mut sub = app.state.activation.get_or_create(user).await.unwrap();
    sub.plan = PlanTier::Pro;
    sub.status = SubscriptionStatus::Active;
    sub.billing_cycle = BillingCycle::Monthly;
    // The hour of slack keeps whole-day arithmetic stable while the
    // test runs.
    sub.expiry_date = Some(Utc::now() + Duration::days(expires_in_days) + Duration::hours(1));
    app.state.subscriptions.save(&sub).await.unwrap();
}

#[tokio::test]
async fn expiry_sweep_is_idempotent() {
    let app = TestApp::spawn().await;
    seed_active(&app, "overdue@example.com", -2).await;
    seed_active(&app, "current@example.com", 10).await;

    let now = Utc::now();
    let expired = expire_overdue_subscriptions(&app.state.subscriptions, now)
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let sub = app
        .state
        .subscriptions
        .find_by_user("overdue@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert!(!sub.auto_renew);

    let untouched = app
        .state
        .subscriptions
        .find_by_user("current@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.status, SubscriptionStatus::Active);

    // Re-running finds nothing new to do.
    let expired = expire_overdue_subscriptions(&app.state.subscriptions, now)
        .await
        .unwrap();
    assert_eq!(expired, 0);
}

#[tokio::test]
async fn trial_expiry_reverts_to_free_and_is_idempotent() {
    let app = TestApp::spawn().await;
    app.state.activation.start_trial(TEST_USER).await.unwrap();

    // Force the trial window shut.
    let mut sub = app
        .state
        .subscriptions
        .find_by_user(TEST_USER)
        .await
        .unwrap()
        .unwrap();
    sub.trial_end = Some(Utc::now() - Duration::hours(1));
    app.state.subscriptions.save(&sub).await.unwrap();

    let now = Utc::now();
    assert_eq!(
        revert_ended_trials(&app.state.subscriptions, now)
            .await
            .unwrap(),
        1
    );

    let sub = app
        .state
        .subscriptions
        .find_by_user(TEST_USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.plan, PlanTier::Free);
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(!sub.is_trial);
    assert!(sub.trial_used);
    assert_eq!(sub.credits, CreditBalance::metered(10));

    assert_eq!(
        revert_ended_trials(&app.state.subscriptions, now)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn credit_reset_runs_in_monthly_lockstep() {
    let app = TestApp::spawn().await;

    // Stale ledger from two months ago, partially consumed.
    seed_active(&app, "stale@example.com", 20).await;
    let mut stale = app
        .state
        .subscriptions
        .find_by_user("stale@example.com")
        .await
        .unwrap()
        .unwrap();
    stale.credits = CreditBalance::Metered {
        total: 500,
        used: 321,
        remaining: 179,
    };
    stale.usage.ai_analyses = 12;
    stale.last_credit_reset = Utc::now() - Duration::days(62);
    app.state.subscriptions.save(&stale).await.unwrap();

    // Already reset this month.
    seed_active(&app, "fresh@example.com", 20).await;

    let now = Utc::now();
    let reset = reset_monthly_credits(&app.state.subscriptions, now)
        .await
        .unwrap();
    assert_eq!(reset, 1);

    let stale = app
        .state
        .subscriptions
        .find_by_user("stale@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale.credits, CreditBalance::metered(500));
    assert_eq!(stale.usage.ai_analyses, 0);

    // Lockstep: nothing further to reset this month.
    let reset = reset_monthly_credits(&app.state.subscriptions, now)
        .await
        .unwrap();
    assert_eq!(reset, 0);
}

#[tokio::test]
async fn renewal_reminders_fire_once_per_window() {
    let app = TestApp::spawn().await;
    seed_active(&app, "soon@example.com", 3).await;
    seed_active(&app, "later@example.com", 5).await;

    let notifier: Arc<dyn Notifier> = app.notifier.clone();
    let now = Utc::now();

    let sent = send_renewal_reminders(&app.state.subscriptions, &notifier, now)
        .await
        .unwrap();
    assert_eq!(sent, 1);
    assert_eq!(app.notifier.send_count(), 1);
    assert_eq!(app.notifier.recipients(), vec!["soon@example.com"]);

    // An immediate re-run is suppressed by the reminder stamp.
    let sent = send_renewal_reminders(&app.state.subscriptions, &notifier, now)
        .await
        .unwrap();
    assert_eq!(sent, 0);
    assert_eq!(app.notifier.send_count(), 1);
}

#[tokio::test]
async fn reminder_windows_cover_seven_three_and_one_days() {
    let app = TestApp::spawn().await;
    seed_active(&app, "week@example.com", 7).await;
    seed_active(&app, "three@example.com", 3).await;
    seed_active(&app, "tomorrow@example.com", 1).await;
    seed_active(&app, "month@example.com", 25).await;

    let notifier: Arc<dyn Notifier> = app.notifier.clone();
    let sent = send_renewal_reminders(&app.state.subscriptions, &notifier, Utc::now())
        .await
        .unwrap();

    assert_eq!(sent, 3);
    let mut recipients = app.notifier.recipients();
    recipients.sort();
    assert_eq!(
        recipients,
        vec![
            "three@example.com",
            "tomorrow@example.com",
            "week@example.com"
        ]
    );
}
