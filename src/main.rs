use anyhow::Context;
use clap::Parser;
use perpbot::session::{ExchangeContextFactory, SessionManager, StaticAccountStore, SubscriptionParams};
use perpbot::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration};

const STATUS_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Parser)]
#[command(name = "perpbot", about = "Bollinger mean reversion on perpetual futures")]
struct Args {
    /// Settings file (TOML); PERPBOT__* environment variables override it
    #[arg(short, long, default_value = "perpbot.toml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    setup_logging(args.json);

    tracing::info!("🚀 PerpBot starting");

    let settings = Settings::load(Some(&args.config))
        .with_context(|| format!("loading settings from {}", args.config.display()))?;
    tracing::info!(
        "Network: {:?} | ws: {} | {} account(s), {} strateg(ies)",
        settings.network,
        settings.ws_url(),
        settings.accounts.len(),
        settings.strategies.len()
    );

    let accounts = Arc::new(StaticAccountStore::from_config(&settings.accounts));
    let factory = Arc::new(ExchangeContextFactory::new(settings.clone())?);
    let manager = Arc::new(SessionManager::new(factory, accounts));

    for instance in &settings.strategies {
        let mut params = SubscriptionParams::for_coin(&instance.coin);
        params.account_alias = instance.account_alias.clone();
        params.account_address = instance.account_address.clone();
        params.interval = instance.interval.clone();

        // Setup errors stop the bot; anything else is visible in the stats
        let pair = manager
            .add_strategy_subscriptions(params)
            .await
            .with_context(|| format!("starting strategy for {}", instance.coin))?;
        tracing::info!("✅ {} strategy running ({} + {})", instance.coin, pair.candle, pair.user_fills);
    }

    let status_manager = manager.clone();
    let status_task = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(STATUS_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let stats = status_manager.stats();
            tracing::info!(
                "📈 Subscriptions: {} total, {} active, {} inactive, {} error | connected: {}",
                stats.total,
                stats.active,
                stats.inactive,
                stats.error,
                status_manager.is_any_connected().await
            );
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = status_task => {
            tracing::error!("Status loop exited: {:?}", result);
        }
    }

    let removed = manager.clear_all().await;
    manager.shutdown().await;
    tracing::info!("👋 Shutdown complete ({} subscriptions removed)", removed);

    Ok(())
}

fn setup_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("perpbot=info,perpbot::strategy=debug"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
