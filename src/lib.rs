//! Affiliate referral attribution and commission settlement.
//!
//! Storefront and subscription webhooks become referral rows in the ledger,
//! commissions accrue per affiliate tier, and admin-triggered payout runs are
//! disbursed through a payment processor and reconciled back to the ledger.

pub mod affiliates;
pub mod api;
pub mod attribution;
pub mod auth;
pub mod backoff;
pub mod commission;
pub mod config;
pub mod customer;
pub mod diagnostics;
pub mod error;
pub mod fraud;
pub mod ledger;
pub mod notify;
pub mod payouts;
pub mod processor;
pub mod reconcile;
pub mod responses;
pub mod settlement;
pub mod signature;
pub mod storefront;
pub mod types;
pub mod webhooks;

use anyhow::Context;
use anyhow::Result;
pub use api::{AppState, Capabilities, Settings, init_router};
use sqlx::{PgPool, postgres::PgPoolOptions};

/// Initializes the database pool.
pub async fn init_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}
