use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub razorpay: RazorpayConfig,
    pub smtp: SmtpConfig,
    pub webhook: WebhookConfig,
    pub jobs: JobsConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
    /// Gateway calls fail closed after this many seconds.
    pub request_timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
    pub from_email: String,
    pub from_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WebhookConfig {
    /// Capacity of the deferred-processing queue.
    pub queue_size: usize,
}

#[derive(Deserialize, Clone, Debug)]
pub struct JobsConfig {
    pub enabled: bool,
    pub expiry_sweep_interval_secs: u64,
    pub credit_reset_interval_secs: u64,
    pub reminder_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("SUBSCRIPTION_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SUBSCRIPTION_SERVICE_PORT")
            .unwrap_or_else(|_| "3005".to_string())
            .parse()?;

        let db_url = env::var("SUBSCRIPTION_DATABASE_URL")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let db_name = env::var("SUBSCRIPTION_DATABASE_NAME")
            .unwrap_or_else(|_| "subscription_db".to_string());

        let razorpay_key_id = env::var("RAZORPAY_KEY_ID").unwrap_or_default();
        let razorpay_key_secret = env::var("RAZORPAY_KEY_SECRET").unwrap_or_default();
        let razorpay_webhook_secret = env::var("RAZORPAY_WEBHOOK_SECRET").unwrap_or_default();
        let razorpay_api_base_url = env::var("RAZORPAY_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string());
        let razorpay_timeout = env::var("RAZORPAY_REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;

        let smtp_enabled = env::var("SMTP_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);
        let smtp_host = env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string());
        let smtp_port = env::var("SMTP_PORT")
            .unwrap_or_else(|_| "587".to_string())
            .parse()?;
        let smtp_user = env::var("SMTP_USER").unwrap_or_default();
        let smtp_password = env::var("SMTP_PASSWORD").unwrap_or_default();
        let smtp_from_email =
            env::var("SMTP_FROM_EMAIL").unwrap_or_else(|_| "billing@localhost".to_string());
        let smtp_from_name = env::var("SMTP_FROM_NAME").unwrap_or_else(|_| "Billing".to_string());

        let webhook_queue_size = env::var("WEBHOOK_QUEUE_SIZE")
            .unwrap_or_else(|_| "256".to_string())
            .parse()?;

        let jobs_enabled = env::var("JOBS_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let expiry_sweep_interval_secs = env::var("JOBS_EXPIRY_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()?;
        let credit_reset_interval_secs = env::var("JOBS_CREDIT_RESET_INTERVAL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()?;
        let reminder_interval_secs = env::var("JOBS_REMINDER_INTERVAL_SECS")
            .unwrap_or_else(|_| "21600".to_string())
            .parse()?;

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            razorpay: RazorpayConfig {
                key_id: razorpay_key_id,
                key_secret: Secret::new(razorpay_key_secret),
                webhook_secret: Secret::new(razorpay_webhook_secret),
                api_base_url: razorpay_api_base_url,
                request_timeout_secs: razorpay_timeout,
            },
            smtp: SmtpConfig {
                enabled: smtp_enabled,
                host: smtp_host,
                port: smtp_port,
                user: smtp_user,
                password: Secret::new(smtp_password),
                from_email: smtp_from_email,
                from_name: smtp_from_name,
            },
            webhook: WebhookConfig {
                queue_size: webhook_queue_size,
            },
            jobs: JobsConfig {
                enabled: jobs_enabled,
                expiry_sweep_interval_secs,
                credit_reset_interval_secs,
                reminder_interval_secs,
            },
            service_name: "subscription-service".to_string(),
        })
    }
}
