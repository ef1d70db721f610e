// =============================================================================
// PulseBoard — Main Entry Point
// =============================================================================
//
// One binary, mode-selected: the alert worker, the scanner/screener API
// service, the candle-cache rebuild, and the bulk download jobs. Every mode
// runs to completion (or until ctrl-c for the long-running ones) and exits
// zero; an invalid mode fails argument parsing and exits nonzero.
// =============================================================================

mod alerts;
mod api;
mod config;
mod downloads;
mod error;
mod scanner;
mod screener;
mod stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::dispatcher::{NotificationDispatcher, WebhookHandler};
use crate::alerts::engine::{AlertEngine, EngineEvent};
use crate::alerts::provider::{AlertDataProvider, MockProvider, StreamerProvider};
use crate::alerts::store::SupabaseAlertStore;
use crate::api::ideas::IdeasClient;
use crate::api::ApiState;
use crate::config::Config;
use crate::downloads::Dataset;
use crate::scanner::candles::{CandleProvider, FileCandleProvider};
use crate::scanner::metadata::InMemoryMetadataProvider;
use crate::scanner::models::Market;
use crate::scanner::{MarketState, ScannerEngine};
use crate::screener::quotes::{InstrumentKeyMap, OhlcQuoteFetcher};
use crate::screener::FeatureTable;

/// Feature-table reload cadence for the API service.
const TABLE_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Bars pulled per symbol when rebuilding a candle cache.
const CANDLE_BARS: u32 = 300;

/// Upstream caps for the alert quote feed.
const MAX_QUOTE_CONNECTIONS: usize = 4;
const MAX_TICKERS_PER_CONNECTION: usize = 1000;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Bulk-download fundamentals snapshots.
    DownloadFundamental,
    /// Bulk-download symbol research snapshots.
    DownloadMs,
    /// Bulk-download compliance snapshots.
    DownloadCompliance,
    /// Rebuild the per-market candle caches.
    Scan,
    /// Run the realtime alert worker.
    Alerts,
    /// Serve the scanner/screener API.
    Scanner,
}

#[derive(Debug, Parser)]
#[command(name = "pulseboard", about = "Market data alert and screening platform")]
struct Cli {
    #[arg(long, value_enum)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    info!(mode = ?cli.mode, "pulseboard starting");

    match cli.mode {
        Mode::DownloadFundamental => run_download(&config, Dataset::Fundamental).await,
        Mode::DownloadMs => run_download(&config, Dataset::Research).await,
        Mode::DownloadCompliance => run_download(&config, Dataset::Compliance).await,
        Mode::Scan => run_candle_rebuild(&config).await,
        Mode::Alerts => run_alerts_worker(&config).await,
        Mode::Scanner => run_scanner_service(&config).await,
    }
}

// =============================================================================
// Download modes
// =============================================================================

async fn run_download(config: &Config, dataset: Dataset) -> Result<()> {
    let table = FeatureTable::load(config.feature_table_path())?;
    downloads::run_download(config, &table, dataset).await
}

// =============================================================================
// Candle cache rebuild
// =============================================================================

async fn run_candle_rebuild(config: &Config) -> Result<()> {
    let table = FeatureTable::load(config.feature_table_path())?;
    let tickers = table.tickers()?;
    if tickers.is_empty() {
        warn!("feature table is empty — nothing to rebuild");
        return Ok(());
    }

    for market in [Market::India, Market::Us] {
        let provider = FileCandleProvider::new(
            config.candle_cache_path(&market.to_string()),
            tickers.clone(),
            CANDLE_BARS,
        );
        match provider.refresh_data().await {
            Ok(tables) => info!(market = %market, symbols = tables.len(), "candle cache rebuilt"),
            Err(e) => error!(market = %market, error = %e, "candle rebuild failed"),
        }
    }
    Ok(())
}

// =============================================================================
// Alerts worker
// =============================================================================

async fn run_alerts_worker(config: &Config) -> Result<()> {
    let webhook_url = config.require_webhook_url()?;
    let (store_url, store_key) = config.require_store()?;

    // Dispatcher first: the engine needs its queue.
    let mut dispatcher = NotificationDispatcher::new();
    dispatcher.register_handler(Arc::new(WebhookHandler::new(webhook_url)));
    let dispatch_tx = dispatcher.sender();
    let _dispatch_task = dispatcher.start();

    let store = Arc::new(SupabaseAlertStore::new(store_url, store_key));

    // ALERT_MOCK_FEED swaps in the synthetic tick source for wiring checks
    // without upstream connectivity.
    let provider: Arc<dyn AlertDataProvider> = if std::env::var("ALERT_MOCK_FEED").is_ok() {
        warn!("ALERT_MOCK_FEED set — using the synthetic tick source");
        Arc::new(MockProvider::new())
    } else {
        Arc::new(StreamerProvider::new(
            MAX_QUOTE_CONNECTIONS,
            MAX_TICKERS_PER_CONNECTION,
        ))
    };

    let engine = AlertEngine::new(store.clone(), provider, dispatch_tx);

    // Wire the store change feed into the engine inbox.
    let inbox = engine.event_sender();
    let (change_tx, mut change_rx) = mpsc::channel(256);
    let _feed_task = store.subscribe_to_changes(change_tx);
    tokio::spawn(async move {
        while let Some(change) = change_rx.recv().await {
            if inbox.send(EngineEvent::Change(change)).await.is_err() {
                return;
            }
        }
    });

    tokio::select! {
        result = engine.run() => {
            error!("alert engine stopped unexpectedly");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping alert worker");
            Ok(())
        }
    }
}

// =============================================================================
// Scanner / screener API service
// =============================================================================

async fn run_scanner_service(config: &Config) -> Result<()> {
    let table = Arc::new(FeatureTable::load(config.feature_table_path())?);
    let tickers = table.tickers()?;

    // Ticker ↔ instrument-key translation is built once from the table and
    // treated as immutable while streaming.
    let key_map = InstrumentKeyMap::from_rows(&table.rows_by_ticker()?);
    info!(instruments = key_map.len(), "instrument key map built");
    let fetcher = Arc::new(OhlcQuoteFetcher::new(key_map));

    // Per-market scanner inputs. Both markets project metadata from the
    // shared feature table; candle caches are per-market files.
    let mut markets = HashMap::new();
    for market in [Market::India, Market::Us] {
        let candle_provider = Arc::new(FileCandleProvider::new(
            config.candle_cache_path(&market.to_string()),
            tickers.clone(),
            CANDLE_BARS,
        ));
        let metadata_table = table.clone();
        let metadata_provider = Arc::new(
            InMemoryMetadataProvider::with_loader(Box::new(move || {
                metadata_table.rows_by_ticker()
            }))
            .context("failed to build metadata provider")?,
        );
        markets.insert(
            market,
            MarketState::new(candle_provider, metadata_provider)?,
        );
    }
    let scanner = Arc::new(ScannerEngine::new(markets, true));

    let state = Arc::new(ApiState {
        table: table.clone(),
        scanner,
        fetcher,
        ideas: Arc::new(IdeasClient::new()),
    });

    // Periodic feature-table reload, matching the snapshot publish cadence.
    let refresh_table = table.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TABLE_REFRESH_INTERVAL);
        interval.tick().await; // the table was just loaded
        loop {
            interval.tick().await;
            let table = refresh_table.clone();
            let result = tokio::task::spawn_blocking(move || table.reload()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "feature table reload failed"),
                Err(e) => error!(error = %e, "feature table reload task panicked"),
            }
        }
    });

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("API server failed")
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping API service");
            Ok(())
        }
    }
}
