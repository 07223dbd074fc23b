//! Application startup and lifecycle management.

use crate::config::Config;
use crate::error::AppError;
use crate::services::store::{MongoPaymentStore, MongoSubscriptionStore};
use crate::services::{init_metrics, RazorpayClient, SmtpNotifier};
use crate::{app_router, jobs, AppState};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    state: AppState,
    jobs_shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration: connect the
    /// stores, wire the services, and start the background workers.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        init_metrics();

        let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!("Failed to parse MongoDB connection string: {}", e);
                AppError::DatabaseError(e.into())
            })?;
        client_options.app_name = Some(config.service_name.clone());

        let client = Client::with_options(client_options).map_err(|e| {
            tracing::error!("Failed to create MongoDB client: {}", e);
            AppError::DatabaseError(e.into())
        })?;
        let db = client.database(&config.database.db_name);

        let payments = MongoPaymentStore::new(&db);
        payments.init_indexes().await?;
        let subscriptions = MongoSubscriptionStore::new(&db);
        subscriptions.init_indexes().await?;

        let razorpay = RazorpayClient::new(config.razorpay.clone());
        if razorpay.is_configured() {
            tracing::info!("Razorpay client initialized");
        } else {
            tracing::warn!("Razorpay credentials not configured - order creation will be refused");
        }

        let notifier = Arc::new(SmtpNotifier::new(config.smtp.clone())?);

        let state = AppState::new(
            config.clone(),
            Arc::new(payments),
            Arc::new(subscriptions),
            razorpay,
            notifier.clone(),
        );

        let jobs_shutdown = jobs::spawn_scheduler(
            state.subscriptions.clone(),
            notifier,
            config.jobs.clone(),
        );

        Ok(Self {
            port: config.server.port,
            state,
            jobs_shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the HTTP server until stopped.
    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        tracing::info!("Listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let router = app_router(self.state.clone());

        let result = axum::serve(listener, router).await;

        self.jobs_shutdown.cancel();
        self.state.webhooks.shutdown();

        result.map_err(Into::into)
    }
}
