pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use services::notifier::Notifier;
use services::store::{PaymentStore, SubscriptionStore};
use services::{OrderService, RazorpayClient, SubscriptionService};
use webhooks::{WebhookDispatcher, WebhookProcessor};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub payments: Arc<dyn PaymentStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub razorpay: RazorpayClient,
    pub activation: SubscriptionService,
    pub orders: OrderService,
    pub webhooks: WebhookDispatcher,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    /// Wire the services over the given stores and gateway client and
    /// spawn the webhook worker. Requires a running Tokio runtime.
    pub fn new(
        config: Config,
        payments: Arc<dyn PaymentStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        razorpay: RazorpayClient,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let activation = SubscriptionService::new(subscriptions.clone(), payments.clone());
        let orders = OrderService::new(razorpay.clone(), payments.clone(), activation.clone());
        let processor = WebhookProcessor::new(payments.clone(), activation.clone());
        let webhooks = WebhookDispatcher::spawn(processor, config.webhook.queue_size);

        Self {
            config,
            payments,
            subscriptions,
            razorpay,
            activation,
            orders,
            webhooks,
            notifier,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        // Subscription endpoints (authenticated)
        .route("/subscription", get(handlers::subscription::get_subscription))
        .route(
            "/subscription/create-order",
            post(handlers::subscription::create_order),
        )
        .route(
            "/subscription/verify-payment",
            post(handlers::subscription::verify_payment),
        )
        .route(
            "/subscription/cancel",
            post(handlers::subscription::cancel_subscription),
        )
        .route(
            "/subscription/upgrade",
            post(handlers::subscription::upgrade_subscription),
        )
        .route(
            "/subscription/trial/start",
            post(handlers::subscription::start_trial),
        )
        .route(
            "/subscription/trial/cancel",
            post(handlers::subscription::cancel_trial),
        )
        .route("/subscription/usage", get(handlers::subscription::get_usage))
        .route(
            "/subscription/billing-history",
            get(handlers::subscription::billing_history),
        )
        .route(
            "/subscription/referral-code",
            get(handlers::subscription::referral_code),
        )
        // Gateway callbacks
        .route("/webhooks/razorpay", post(handlers::webhook::razorpay_webhook))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}
