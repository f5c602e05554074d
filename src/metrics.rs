// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data snapshots processed").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "market data snapshots per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static SNAPSHOTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "snapshots_dropped_total",
            "snapshots not processed (labels: symbol, reason = stale|duplicate|backpressure)",
        ),
        &["symbol", "reason"],
    )
    .unwrap()
});

pub static SNAPSHOTS_REORDERED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("snapshots_reordered_total", "late snapshots put back in order"),
        &["symbol"],
    )
    .unwrap()
});

pub static COMPUTE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("indicator_errors_total", "indicator computation errors per symbol"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Decision pipeline --------
pub static SIGNALS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("signals_total", "strategy signals").unwrap());

pub static SIGNALS_BY: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "signals_total_by",
            "strategy signals by strategy & symbol (labels: strategy, symbol)",
        ),
        &["strategy", "symbol"],
    )
    .unwrap()
});

pub static INTENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("intents_total", "trade intents sent to execution (label: kind = open|close)"),
        &["kind"],
    )
    .unwrap()
});

pub static RISK_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("risk_rejections_total", "risk gate rejections by reason code"),
        &["reason"],
    )
    .unwrap()
});

// -------- Execution --------
pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "exec_reports_total",
            "execution reports (label: status = filled|partial|retry|rejected|timeout)",
        ),
        &["status"],
    )
    .unwrap()
});

// Latency from submit -> fill (milliseconds)
pub static EXEC_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("exec_latency_ms", "Latency from submit to fill (ms)")
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
    )
    .unwrap()
});

// -------- Portfolio --------
pub static EQUITY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_equity", "total equity incl. unrealized").unwrap());

pub static DRAWDOWN: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_drawdown", "drawdown from high-water mark (0..1)").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_unrealized", "unrealized PnL").unwrap());

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "positions Open or Closing").unwrap());

pub static ALERTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("operator_alerts_total", "alerts needing manual action").unwrap());

pub static HALTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pipeline_halted", "1 while new intents are blocked").unwrap());

// ---- Config visibility (feed / strategies / symbols) ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_STRATEGY_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_strategy_active", "active strategies (label: strategy)"),
        &["strategy"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; re-registration is ignored
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS_DROPPED.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS_REORDERED.clone())),
        REGISTRY.register(Box::new(COMPUTE_ERRORS.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(SIGNALS_BY.clone())),
        REGISTRY.register(Box::new(INTENTS.clone())),
        REGISTRY.register(Box::new(RISK_REJECTS.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(EXEC_LATENCY.clone())),
        REGISTRY.register(Box::new(EQUITY.clone())),
        REGISTRY.register(Box::new(DRAWDOWN.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(ALERTS.clone())),
        REGISTRY.register(Box::new(HALTED.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_STRATEGY_ACTIVE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_encodes() {
        init();
        init();
        RISK_REJECTS.with_label_values(&["drawdown_breach"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("risk_rejections_total"));
    }
}
