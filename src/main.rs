// ===============================
// src/main.rs
// ===============================
/*
 # jalankan (mock feed + mock venue)
 RUST_LOG=info cargo run --release -- --symbols BTCUSDT,ETHUSDT

 # konfigurasi yang aktif
 curl -s localhost:9898/metrics | egrep '^config_(feed_mode|symbol|strategy_active)'

 # aktivitas per symbol & strategi
 curl -s localhost:9898/metrics | grep '^ticks_total_by_symbol'
 curl -s localhost:9898/metrics | grep '^signals_total_by'

 # portfolio / posisi / aktivitas terakhir
 curl -s localhost:9898/portfolio
 curl -s localhost:9898/positions
 curl -s localhost:9898/recent
*/
/*
=============================================================================
Project : tradeflow_bot: strategy-to-order decision pipeline in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams multi-symbol bars (mock/Binance), computes indicators,
          runs technical & options strategies, gates intents through the
          risk manager, tracks positions/PnL, persists portfolio state,
          exposes Prometheus metrics + monitoring, and records JSONL events.
=============================================================================
*/
use std::sync::Arc;

use clap::Parser;
use tokio::{select, task::JoinHandle, time::{interval, Duration, MissedTickBehavior}};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tradeflow_bot::config::{self, Cli, FeedMode, Settings};
use tradeflow_bot::feed;
use tradeflow_bot::metrics;
use tradeflow_bot::monitor;
use tradeflow_bot::pipeline::Pipeline;
use tradeflow_bot::store::{JsonFileStore, MemoryStore, PortfolioStore};
use tradeflow_bot::PipelineError;

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let cli = Cli::parse();
    let settings = match config::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "invalid configuration");
            return Err(e);
        }
    };

    if settings.dry_run {
        info!("dry run: portfolio state kept in memory");
        run(settings, MemoryStore::default()).await
    } else {
        let store = JsonFileStore::new(&settings.state_dir);
        info!(path = %store.path().display(), "portfolio snapshot");
        run(settings, store).await
    }
}

fn export_config(settings: &Settings) {
    metrics::CONFIG_FEED_MODE
        .with_label_values(&[settings.feed_mode.as_str()])
        .set(1);
    for s in &settings.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }
    for name in &settings.strategy_names {
        metrics::CONFIG_STRATEGY_ACTIVE.with_label_values(&[name]).set(1);
    }
}

async fn run<S: PortfolioStore>(settings: Settings, store: S) -> Result<(), PipelineError> {
    // ---- Metrics ----
    metrics::init();
    export_config(&settings);

    info!(
        feed_mode = %settings.feed_mode.as_str(),
        symbols = ?settings.symbols,
        strategies = ?settings.strategy_names,
        equity = settings.initial_equity,
        max_drawdown = settings.risk.max_drawdown,
        max_symbol_notional = settings.risk.max_symbol_notional,
        binance_ws = %settings.binance_ws_url,
        "startup config"
    );

    // ---- Pipeline ----
    let gateway = Arc::new(settings.mock_gateway.clone());
    let pipeline = Pipeline::start(&settings, gateway, store).await?;

    // ---- Monitoring HTTP ----
    let exporter = pipeline.monitor();
    let port = settings.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = monitor::serve(exporter, port).await {
            error!(?e, port, "monitoring server failed");
        }
    });

    // ---- FEED (Market Data) ----
    let feed_tx = pipeline
        .feed_sender()
        .ok_or(PipelineError::ChannelClosed("feed"))?;
    let mut feeds: Vec<JoinHandle<()>> = Vec::new();
    for sym in settings.symbols.iter().cloned() {
        let tx = feed_tx.clone();
        let handle = match settings.feed_mode {
            FeedMode::Mock => tokio::spawn(feed::run_mock(tx, sym, settings.mock_feed.clone())),
            FeedMode::BinanceSandbox | FeedMode::BinanceMainnet => {
                tokio::spawn(feed::run_binance(tx, sym, settings.binance_ws_url.clone()))
            }
        };
        feeds.push(handle);
    }
    drop(feed_tx);

    // ---- Heartbeat + Ctrl-C ----
    let mut beat = interval(Duration::from_secs(1));
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_ticks = metrics::TICKS.get();
    loop {
        select! {
            _ = beat.tick() => {
                let now = metrics::TICKS.get();
                info!(
                    ticks = now - last_ticks,
                    equity = metrics::EQUITY.get(),
                    drawdown = metrics::DRAWDOWN.get(),
                    open_positions = metrics::OPEN_POSITIONS.get(),
                    "heartbeat"
                );
                last_ticks = now;
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(?e, "ctrl_c listener failed, shutting down");
                }
                info!("shutdown requested");
                break;
            }
        }
    }

    // ---- Graceful shutdown ----
    for f in &feeds {
        f.abort();
    }
    for f in feeds {
        let _ = f.await;
    }
    let state = pipeline.shutdown().await?;
    info!(
        equity = state.equity,
        realized_pnl = state.realized_pnl,
        open_positions = state.positions.len(),
        pending = state.pending.len(),
        "bye"
    );
    Ok(())
}
