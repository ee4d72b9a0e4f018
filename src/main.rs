use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{middleware, Extension};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{fmt, EnvFilter};

use kyora::accounting;
use kyora::billing::{BillingService, StripeClient};
use kyora::config::Config;
use kyora::events::EventBus;
use kyora::mailer;
use kyora::oauth::GoogleOauthClient;
use kyora::onboarding::{self, OnboardingEngine};
use kyora::pipeline;
use kyora::routes::api_routes;

const SESSION_SWEEP_INTERVAL_SECS: u64 = 3600;
const RECURRING_TICK_INTERVAL_SECS: u64 = 3600;
const SHUTDOWN_DRAIN_SECS: u64 = 10;

#[derive(Parser)]
#[command(name = "kyora", about = "Kyora server core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Server,
    /// Reconcile plan definitions to the provider and the local store
    SyncPlans,
    /// Delete expired and stale committed onboarding sessions
    OnboardingCleanup,
    /// Emit one tick of due recurring expenses
    Recurring,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Arc::new(Config::load()?);
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_open_conns)
        .connect(&config.database.dsn)
        .await?;

    if config.database.auto_migrate {
        sqlx::migrate!().run(&pool).await?;
    }

    match cli.command {
        Command::Server => serve(config, pool).await,
        Command::SyncPlans => {
            let stripe = StripeClient::new(&config.billing.stripe);
            let synced = BillingService::new(pool).sync_plans(&stripe).await?;
            tracing::info!(synced, "plan definitions reconciled");
            Ok(())
        }
        Command::OnboardingCleanup => {
            let removed = onboarding::sweep_sessions(&pool, Utc::now()).await?;
            tracing::info!(removed, "onboarding sessions removed");
            Ok(())
        }
        Command::Recurring => {
            let emitted = accounting::generator::emit_due(&pool, Utc::now().date_naive()).await?;
            tracing::info!(emitted, "recurring expenses emitted");
            Ok(())
        }
    }
}

async fn serve(config: Arc<Config>, pool: PgPool) -> anyhow::Result<()> {
    let stripe = Arc::new(StripeClient::new(&config.billing.stripe));
    let oauth = Arc::new(GoogleOauthClient::new(config.auth.google_oauth.clone()));
    let mailer = mailer::from_config(&config.email);

    if config.billing.auto_sync_plans {
        let synced = BillingService::new(pool.clone()).sync_plans(&stripe).await?;
        tracing::info!(synced, "plans auto-synced at startup");
    }

    let engine = OnboardingEngine::new(
        pool.clone(),
        config.clone(),
        stripe.clone(),
        oauth.clone(),
        mailer.clone(),
    );

    let mut bus_builder = EventBus::builder();
    accounting::subscribe_order_payments(&mut bus_builder, pool.clone());
    onboarding::subscribe_payment_confirmations(&mut bus_builder, engine.clone());
    let bus = bus_builder.start();

    onboarding::spawn_session_sweeper(pool.clone(), SESSION_SWEEP_INTERVAL_SECS);
    accounting::spawn_recurring_scheduler(pool.clone(), RECURRING_TICK_INTERVAL_SECS);

    let app = api_routes()
        .layer(middleware::from_fn(pipeline::body_limit))
        .layer(DefaultBodyLimit::max(config.http.max_body_bytes))
        .layer(Extension(pool))
        .layer(Extension(config.clone()))
        .layer(Extension(bus))
        .layer(Extension(engine))
        .layer(Extension(stripe))
        .layer(Extension(oauth))
        .layer(Extension(mailer));

    let addr: SocketAddr = ([0, 0, 0, 0], config.http.port).into();
    tracing::info!(%addr, env = %config.env, "listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

/// Resolves on SIGINT/SIGTERM. Once signaled, in-flight requests get a
/// bounded drain window before the process is forced down.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received; draining");
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(SHUTDOWN_DRAIN_SECS)).await;
        tracing::warn!("drain deadline exceeded; forcing exit");
        std::process::exit(1);
    });
}
