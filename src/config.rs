use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};
use rust_decimal::Decimal;
use serde::Deserialize;

pub const DEFAULT_PAYPAL_BASE_URL: &str = "https://api-m.sandbox.paypal.com";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub run_migrations: bool,

    pub storefront_webhook_secret: Option<String>,
    pub subscription_webhook_secret: Option<String>,
    pub disbursement_webhook_secret: Option<String>,

    /// Comma-separated identity-provider subjects allowed on admin routes.
    pub admin_ids: String,
    pub min_payout: Decimal,
    /// Fraction off the customer's order for provisioned discount codes.
    pub customer_discount: Decimal,
    pub poll_interval_secs: u64,
    pub http_timeout_secs: u64,

    pub paypal_base_url: String,
    pub paypal_client_id: Option<String>,
    pub paypal_client_secret: Option<String>,

    pub notify_base_url: Option<String>,
    pub notify_api_key: Option<String>,

    pub storefront_api_url: Option<String>,
    pub storefront_access_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::defaults()?
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }

    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("run_migrations", true)?
            .set_default("admin_ids", "")?
            .set_default("min_payout", "25.00")?
            .set_default("customer_discount", "0.10")?
            .set_default("poll_interval_secs", 600)?
            .set_default("http_timeout_secs", 20)?
            .set_default("paypal_base_url", DEFAULT_PAYPAL_BASE_URL)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Both processor credentials, when configured.
    pub fn paypal_credentials(&self) -> Option<(&str, &str)> {
        Some((present(&self.paypal_client_id)?, present(&self.paypal_client_secret)?))
    }

    pub fn notify_endpoint(&self) -> Option<(&str, &str)> {
        Some((present(&self.notify_base_url)?, present(&self.notify_api_key)?))
    }

    pub fn storefront_admin(&self) -> Option<(&str, &str)> {
        Some((
            present(&self.storefront_api_url)?,
            present(&self.storefront_access_token)?,
        ))
    }
}

/// Empty environment variables count as unset.
pub fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
