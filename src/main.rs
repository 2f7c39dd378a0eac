use std::net::SocketAddr;
use std::sync::Arc;

use affiliate_ledger::auth::AdminAuthorizer;
use affiliate_ledger::backoff::Backoff;
use affiliate_ledger::config::{Config, present};
use affiliate_ledger::ledger::PgLedger;
use affiliate_ledger::notify::{HttpNotifier, NoopNotifier, Notifier};
use affiliate_ledger::processor::{PaymentProcessor, PaypalClient, UnconfiguredProcessor};
use affiliate_ledger::signature::{WebhookVerifier, WebhookVerifiers};
use affiliate_ledger::storefront::{DisabledProvisioner, DiscountProvisioner, HttpDiscountProvisioner};
use affiliate_ledger::{AppState, Capabilities, Settings, init_pool, init_router};
use anyhow::Context;
use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    let pool = init_pool(&config.database_url).await?;
    if config.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
    }

    let capabilities = capabilities(&config)?;
    let admins = AdminAuthorizer::from_csv(&config.admin_ids);
    if admins.is_empty() {
        warn!("ADMIN_IDS is empty, admin routes will reject every caller");
    }
    let settings = Settings {
        verifiers: WebhookVerifiers {
            storefront: WebhookVerifier::storefront(present(&config.storefront_webhook_secret)),
            subscription: WebhookVerifier::subscription(present(&config.subscription_webhook_secret)),
            disbursement: WebhookVerifier::disbursement(present(&config.disbursement_webhook_secret)),
        },
        admins,
        min_payout: config.min_payout,
        customer_discount: config.customer_discount,
    };

    let app_state = AppState::new(Arc::new(PgLedger::new(pool)), capabilities, settings);
    let poller = app_state.reconciler.clone().spawn_poller(config.poll_interval());

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let result = axum::serve(listener, init_router(app_state)).await;
    poller.abort();
    result?;
    Ok(())
}

fn capabilities(config: &Config) -> Result<Capabilities> {
    let timeout = config.http_timeout();

    let processor: Arc<dyn PaymentProcessor> = match config.paypal_credentials() {
        Some((client_id, client_secret)) => Arc::new(PaypalClient::new(
            &config.paypal_base_url,
            client_id,
            client_secret,
            timeout,
            Backoff::default(),
        )?),
        None => {
            warn!("payment processor credentials not set, electronic payouts disabled");
            Arc::new(UnconfiguredProcessor)
        }
    };

    let notifier: Arc<dyn Notifier> = match config.notify_endpoint() {
        Some((base_url, api_key)) => Arc::new(HttpNotifier::new(base_url, api_key, timeout)?),
        None => Arc::new(NoopNotifier),
    };

    let provisioner: Arc<dyn DiscountProvisioner> = match config.storefront_admin() {
        Some((api_url, token)) => Arc::new(HttpDiscountProvisioner::new(api_url, token, timeout)?),
        None => Arc::new(DisabledProvisioner),
    };

    Ok(Capabilities {
        processor,
        notifier,
        provisioner,
    })
}
