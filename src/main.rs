mod clock;
mod config;
mod engine;
mod error;
mod poller;
mod rate_limit;
mod service;
mod sources;
mod store;
mod types;
mod wander;

use anyhow::{Context, Result};
use clap::Parser;
use config::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const FIRST_PRICE_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "priceproxy",
    version,
    about = "Poll market-data providers and serve the freshest prices, optionally wandered"
)]
struct Args {
    /// Path to config YAML file
    #[arg(short, long, env = "PRICEPROXY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,
}

fn init_tracing(server: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&server.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let verbose = server.env != "prod";
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(verbose)
        .with_line_number(verbose);
    match server.log_format.as_str() {
        "json" => builder.json().init(),
        "textnocolour" => builder.with_ansi(false).init(),
        _ => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let cfg = config::Config::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    let server = cfg.server().cloned().unwrap_or_default();
    init_tracing(&server);

    info!(
        sources = cfg.sources.len(),
        prices = cfg.prices.len(),
        env = %server.env,
        "Loaded config from {}",
        args.config.display()
    );

    let client = reqwest::Client::builder()
        .user_agent(concat!("priceproxy/", env!("CARGO_PKG_VERSION")))
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("building HTTP client")?;

    let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);
    let registry = engine::build_registry(
        cfg.descriptors(),
        client,
        Arc::clone(&clock),
        rate_limit::DEFAULT_ACQUIRE_TIMEOUT,
    )
    .context("registering sources")?;
    info!("Registered {} price source(s)", registry.source_count());

    let keys: Vec<types::PriceKey> = cfg.prices.iter().map(config::PriceConfig::key).collect();
    let engine = engine::PriceEngine::start(registry, cfg.prices, clock, poller::Backoff::default())
        .context("starting price engine")?;
    info!(pollers = engine.poller_count(), "Started pollers");

    let listener = tokio::net::TcpListener::bind(&server.listen)
        .await
        .with_context(|| format!("binding {}", server.listen))?;
    let state = service::AppState {
        registry: engine.registry(),
        store: engine.store(),
    };
    let first_prices = async {
        let deadline = tokio::time::Instant::now() + FIRST_PRICE_WAIT;
        for key in &keys {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match engine.wait_for_first_price(key, left).await {
                Some(info) => info!(key = %key, price = info.price, "First price available"),
                None => warn!(key = %key, "No price yet after {:?}", FIRST_PRICE_WAIT),
            }
        }
    };
    let (served, ()) = tokio::join!(
        service::serve(listener, state, shutdown_signal()),
        first_prices
    );

    engine.shutdown().await;
    served.context("serving HTTP")
}
