// =============================================================================
// Meridian Live Trading Engine — Main Entry Point
// =============================================================================
//
// The engine starts Paused for safety: market data flows and the monitor
// manages anything reconciliation adopts, but no new entries are taken until
// trading is resumed via the API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod compensation;
mod config;
mod exchange;
mod executor;
mod features;
mod indicators;
mod journal;
mod market_data;
mod monitor;
mod orchestrator;
mod risk;
mod scorer;
mod signal;
mod sizer;
mod state;
mod store;
mod types;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::compensation::CompensationEngine;
use crate::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use crate::exchange::{ExchangeClient, RestExchangeClient};
use crate::executor::OrderExecutor;
use crate::features::TechnicalFeatureComputer;
use crate::journal::TradeJournal;
use crate::market_data::{ExchangeHistory, MarketDataFeed};
use crate::orchestrator::Orchestrator;
use crate::risk::RiskEngine;
use crate::scorer::EnsembleScorer;
use crate::state::EngineState;
use crate::store::PositionStore;
use crate::types::TradingMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Live Trading Engine starting up");

    let mut config = EngineConfig::load(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // SAFETY: always come up Paused; a human resumes trading explicitly.
    config.trading_mode = TradingMode::Paused;

    // Symbol override from the environment.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(
        symbols = ?config.symbols,
        timeframe = %config.timeframe,
        sandbox = config.exchange.sandbox,
        trading_mode = %config.trading_mode,
        "engine configured (starting PAUSED)"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("MERIDIAN_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MERIDIAN_API_SECRET").unwrap_or_default();
    if api_key.is_empty() {
        warn!("MERIDIAN_API_KEY not set — signed endpoints will be rejected");
    }
    let client: Arc<dyn ExchangeClient> = Arc::new(RestExchangeClient::new(
        api_key,
        api_secret,
        config.exchange.sandbox,
        config.exchange.quote_asset.clone(),
    ));

    // ── 3. Core subsystems ───────────────────────────────────────────────
    let starting_equity = 0.0; // corrected by the first balance fetch
    let shared_config = Arc::new(RwLock::new(config.clone()));

    let store = Arc::new(PositionStore::new(config.risk.allow_pyramiding));
    let risk = Arc::new(RiskEngine::new(&config.risk, starting_equity));
    let journal = Arc::new(TradeJournal::new(
        config.journal.trade_log_path.clone(),
        config.journal.snapshot_path.clone(),
        config.journal.session_result_path.clone(),
    ));
    let compensation = Arc::new(CompensationEngine::new(config.compensation.clone()));
    let feed = Arc::new(MarketDataFeed::new(
        client.clone(),
        config.cache_bars,
        config.exchange.backoff_base_secs,
        config.exchange.backoff_cap_secs,
    ));
    let executor = Arc::new(OrderExecutor::new(
        client.clone(),
        store.clone(),
        risk.clone(),
        journal.clone(),
        config.exchange.clone(),
        config.timeframe,
        config.signal.trailing_stop_fraction,
    ));

    let state = Arc::new(EngineState::new(
        shared_config.clone(),
        store,
        risk,
        compensation,
        feed,
        journal,
    ));

    // ── 4. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3001".into());
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "API server bind failed"),
        }
    });

    // ── 5. Shutdown signal ───────────────────────────────────────────────
    let signal_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("SIGINT received — requesting graceful shutdown");
            signal_state.request_shutdown();
        }
    });

    // ── 6. Run the orchestrator ──────────────────────────────────────────
    let duration = std::env::var("MERIDIAN_DURATION_MINUTES")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|mins| std::time::Duration::from_secs(mins * 60));

    let orchestrator = Orchestrator::new(
        state.clone(),
        executor,
        Arc::new(TechnicalFeatureComputer::new(&config.signal)),
        Arc::new(EnsembleScorer::new()),
        Arc::new(ExchangeHistory(client)),
    );
    orchestrator.run(duration).await?;

    // ── 7. Persist config and exit ───────────────────────────────────────
    if let Err(e) = state.config.read().save(DEFAULT_CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Meridian shut down complete");
    Ok(())
}
