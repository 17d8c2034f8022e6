use anyhow::Context;
use clap::Parser;
use energy_escrow::{
    api,
    config::{create_default_config_file, AppConfig},
    deadline::{Clock, SystemClock},
    market::{MarketSettings, Marketplace},
    services::{ExternalServices, InMemoryCertificateRegistry, InMemoryRewardLedger, InMemoryValueLedger},
    Amount,
};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "marketplace")]
#[command(about = "Peer-to-peer energy offer marketplace with oracle-validated escrow")]
struct Args {
    #[arg(short, long, env = "ESCROW_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Write a default config file to the given path and exit.
    #[arg(long)]
    init_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = args.init_config {
        create_default_config_file(&path)
            .with_context(|| format!("writing default config to {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&config);

    let settings = MarketSettings::from_config(&config)?;
    let access = config.access_control()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let services = ExternalServices {
        value: Arc::new(InMemoryValueLedger::with_balances(config.initial_balances()?)),
        rewards: Arc::new(InMemoryRewardLedger::new(
            clock.clone(),
            Amount::from(config.rewards.daily_production_cap),
        )),
        certificates: Arc::new(InMemoryCertificateRegistry::new(clock.clone())),
    };
    let market = Arc::new(Marketplace::new(settings, access, services, clock));

    let app = api::router(market);
    let listener = TcpListener::bind(config.get_server_address()).await?;
    info!("Marketplace listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", config.logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format.as_deref() {
        Some("json") => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
