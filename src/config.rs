// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : tradeflow_bot: strategy-to-order decision pipeline in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams multi-symbol bars (mock/Binance), computes indicators,
          runs technical & options strategies, gates intents through the
          risk manager, tracks positions/PnL, persists portfolio state,
          exposes Prometheus metrics + monitoring, and records JSONL events.
=============================================================================
*/
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use tracing::warn;

use crate::error::PipelineError;
use crate::feed::MockFeedCfg;
use crate::gateway::{ExecCfg, MockGateway};
use crate::indicators::{GapPolicy, IndicatorCfg};
use crate::positions::TrackerCfg;
use crate::risk::{CorrelationMap, RiskLimits};
use crate::strategy::{OptionsCfg, Strategy, TechnicalCfg};

/// Mode sumber market data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
}

impl FeedMode {
    pub fn parse(s: &str) -> Option<FeedMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(FeedMode::Mock),
            "binance_sandbox" => Some(FeedMode::BinanceSandbox),
            "binance_mainnet" => Some(FeedMode::BinanceMainnet),
            _ => None,
        }
    }

    // Endpoint default per mode
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            FeedMode::Mock => "wss://testnet.binance.vision/ws", // tidak dipakai saat mock
            FeedMode::BinanceSandbox => "wss://testnet.binance.vision/ws",
            FeedMode::BinanceMainnet => "wss://stream.binance.com:9443/ws",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::BinanceSandbox => "binance_sandbox",
            FeedMode::BinanceMainnet => "binance_mainnet",
        }
    }
}

/// Command-line flags; they override `.env` and the environment.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "tradeflow_bot", version, about = "Strategy-to-order decision pipeline")]
pub struct Cli {
    /// Load this file instead of `./.env`
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// Comma separated symbols, e.g. BTCUSDT,ETHUSDT
    #[arg(long)]
    pub symbols: Option<String>,
    /// Directory for portfolio snapshot and intent log
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Keep state in memory only
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub symbols: Vec<String>,
    pub feed_mode: FeedMode,
    pub binance_ws_url: String,
    pub mock_feed: MockFeedCfg,
    pub mock_gateway: MockGateway,

    pub strategy_names: Vec<&'static str>,
    pub indicators: IndicatorCfg,
    pub technical: TechnicalCfg,
    pub options: OptionsCfg,

    pub risk: RiskLimits,
    pub correlation: CorrelationMap,
    pub tracker: TrackerCfg,
    pub exec: ExecCfg,

    pub initial_equity: f64,
    pub reorder_tolerance_ms: u64,
    pub symbol_queue: usize,

    pub state_dir: PathBuf,
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub dry_run: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let risk = RiskLimits::default();
        Self {
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            feed_mode: FeedMode::Mock,
            binance_ws_url: FeedMode::Mock.default_ws_url().to_string(),
            mock_feed: MockFeedCfg::default(),
            mock_gateway: MockGateway::default(),
            strategy_names: vec!["technical", "options"],
            indicators: IndicatorCfg::default(),
            technical: TechnicalCfg::default(),
            options: OptionsCfg::default(),
            tracker: TrackerCfg { max_drawdown: risk.max_drawdown, flatten_on_drawdown: false },
            risk,
            correlation: CorrelationMap::default(),
            exec: ExecCfg::default(),
            initial_equity: 100_000.0,
            reorder_tolerance_ms: 2_000,
            symbol_queue: 1024,
            state_dir: PathBuf::from("./state"),
            record_file: None,
            metrics_port: 9898,
            dry_run: false,
        }
    }
}

impl Settings {
    /// Strategies in evaluation order. The options strategy shares the technical vote weights.
    pub fn strategies(&self) -> Vec<Strategy> {
        self.strategy_names
            .iter()
            .filter_map(|name| match *name {
                "technical" => Some(Strategy::Technical(self.technical.clone())),
                "options" => Some(Strategy::Options(OptionsCfg {
                    technical: self.technical.clone(),
                    ..self.options.clone()
                })),
                _ => None,
            })
            .collect()
    }

    pub fn intent_log_path(&self) -> PathBuf {
        self.state_dir.join("intents.jsonl")
    }

    /// Settings that cannot be repaired by falling back to a default.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let bad = |key: &str, reason: String| Err(PipelineError::Config { key: key.into(), reason });
        if self.symbols.is_empty() {
            return bad("SYMBOLS", "no symbols configured".into());
        }
        if self.strategy_names.is_empty() {
            return bad("STRATEGIES", "no known strategy configured".into());
        }
        if !(self.risk.max_drawdown > 0.0 && self.risk.max_drawdown < 1.0) {
            return bad("MAX_DRAWDOWN", format!("{} outside (0,1)", self.risk.max_drawdown));
        }
        if self.risk.min_position_fraction > self.risk.max_position_fraction {
            return bad(
                "MIN_POSITION_FRACTION",
                format!(
                    "{} above MAX_POSITION_FRACTION {}",
                    self.risk.min_position_fraction, self.risk.max_position_fraction
                ),
            );
        }
        if !(self.initial_equity > 0.0) {
            return bad("INITIAL_EQUITY", format!("{} must be positive", self.initial_equity));
        }
        if self.options.iv_low_pct > self.options.iv_high_pct {
            return bad("IV_LOW_PCT", "above IV_HIGH_PCT".into());
        }
        if self.indicators.ema_short >= self.indicators.ema_long {
            return bad("EMA_SHORT", "must be shorter than EMA_LONG".into());
        }
        if self.indicators.macd_fast >= self.indicators.macd_slow {
            return bad("MACD_FAST", "must be shorter than MACD_SLOW".into());
        }
        Ok(())
    }
}

/// Typed reads over a key lookup. Unparseable values warn and keep the default.
struct Env<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn get<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Display,
    {
        match self.raw(key) {
            None => default,
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!(key, value = %v, %default, "invalid config value, using default");
                default
            }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.raw(key).map(|v| v.to_ascii_lowercase()) {
            None => default,
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    warn!(key, value = %v, default, "invalid flag, using default");
                    default
                }
            },
        }
    }
}

fn split_symbols(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

/// Baca `STRATEGIES` (comma separated) atau fallback `STRATEGY` (single).
fn parse_strategies(list: Option<String>, single: Option<String>, default: Vec<&'static str>) -> Vec<&'static str> {
    if let Some(val) = list {
        let mut out: Vec<&'static str> = Vec::new();
        for t in val.split(',') {
            match Strategy::parse_one(t) {
                Some(name) if !out.contains(&name) => out.push(name),
                Some(_) => {}
                None => warn!(strategy = %t.trim(), "unknown strategy ignored"),
            }
        }
        if !out.is_empty() {
            return out;
        }
    }
    if let Some(one) = single.and_then(|s| Strategy::parse_one(&s)) {
        return vec![one];
    }
    default
}

/// Build settings from a key lookup plus CLI overrides.
pub fn from_lookup<F>(lookup: F, cli: &Cli) -> Result<Settings, PipelineError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };
    let d = Settings::default();

    // ===== Symbols & feed =====
    let symbols = cli
        .symbols
        .as_deref()
        .map(split_symbols)
        .or_else(|| env.raw("SYMBOLS").map(|s| split_symbols(&s)))
        .filter(|v| !v.is_empty())
        .or_else(|| env.raw("SYMBOL").map(|s| vec![s.to_ascii_uppercase()]))
        .unwrap_or(d.symbols);

    let feed_mode = match env.raw("FEED_MODE") {
        None => FeedMode::Mock,
        Some(v) => FeedMode::parse(&v).unwrap_or_else(|| {
            warn!(value = %v, "unknown FEED_MODE, using mock");
            FeedMode::Mock
        }),
    };
    let binance_ws_url = env
        .raw("BINANCE_WS_URL")
        .unwrap_or_else(|| feed_mode.default_ws_url().to_string());

    let mf = d.mock_feed;
    let mock_feed = MockFeedCfg {
        start_price: env.get("MOCK_START_PRICE", mf.start_price),
        emit_ms: env.get("MOCK_EMIT_MS", mf.emit_ms),
        bar_interval_ns: 0, // diisi dari BAR_INTERVAL_MS di bawah
        bar_vol: env.get("MOCK_BAR_VOL", mf.bar_vol),
        base_iv: env.get("MOCK_BASE_IV", mf.base_iv),
    };
    let mg = d.mock_gateway;
    let mock_gateway = MockGateway::new(
        env.get("MOCK_FILL_MS", mg.fill_ms),
        env.get("MOCK_REJECT_RATE", mg.reject_rate),
        env.get("MOCK_PARTIAL_RATE", mg.partial_rate),
    );

    // ===== Indicators =====
    let i = d.indicators;
    let gap_policy = match env.raw("GAP_POLICY") {
        None => i.gap_policy,
        Some(v) => GapPolicy::parse(&v).unwrap_or_else(|| {
            warn!(value = %v, "unknown GAP_POLICY, using skip");
            GapPolicy::Skip
        }),
    };
    let bar_interval_ms: i64 = env.get("BAR_INTERVAL_MS", i.bar_interval_ns / 1_000_000);
    let indicators = IndicatorCfg {
        ema_short: env.get("EMA_SHORT", i.ema_short),
        ema_long: env.get("EMA_LONG", i.ema_long),
        rsi_period: env.get("RSI_PERIOD", i.rsi_period),
        macd_fast: env.get("MACD_FAST", i.macd_fast),
        macd_slow: env.get("MACD_SLOW", i.macd_slow),
        macd_signal: env.get("MACD_SIGNAL", i.macd_signal),
        atr_period: env.get("ATR_PERIOD", i.atr_period),
        bollinger_period: env.get("BOLLINGER_PERIOD", i.bollinger_period),
        bollinger_mult: env.get("BOLLINGER_MULT", i.bollinger_mult),
        vol_window: env.get("VOL_WINDOW", i.vol_window),
        periods_per_year: env.get("PERIODS_PER_YEAR", i.periods_per_year),
        iv_min_samples: env.get("IV_MIN_SAMPLES", i.iv_min_samples),
        gap_policy,
        bar_interval_ns: bar_interval_ms.max(1).saturating_mul(1_000_000),
        max_fill_bars: env.get("MAX_FILL_BARS", i.max_fill_bars),
        window_len: env.get("WINDOW_LEN", i.window_len),
    };
    let mock_feed = MockFeedCfg { bar_interval_ns: indicators.bar_interval_ns, ..mock_feed };

    // ===== Strategies =====
    let strategy_names = parse_strategies(env.raw("STRATEGIES"), env.raw("STRATEGY"), d.strategy_names);
    let t = d.technical;
    let technical = TechnicalCfg {
        weight_trend: env.get("WEIGHT_TREND", t.weight_trend),
        weight_macd: env.get("WEIGHT_MACD", t.weight_macd),
        weight_momentum: env.get("WEIGHT_MOMENTUM", t.weight_momentum),
        weight_pivot: env.get("WEIGHT_PIVOT", t.weight_pivot),
        rsi_overbought: env.get("RSI_OVERBOUGHT", t.rsi_overbought),
        rsi_oversold: env.get("RSI_OVERSOLD", t.rsi_oversold),
        vote_threshold: env.get("VOTE_THRESHOLD", t.vote_threshold),
        min_agree: env.get("MIN_AGREE", t.min_agree),
    };
    let o = d.options;
    let options = OptionsCfg {
        iv_low_pct: env.get("IV_LOW_PCT", o.iv_low_pct),
        iv_high_pct: env.get("IV_HIGH_PCT", o.iv_high_pct),
        target_dte: env.get("TARGET_DTE", o.target_dte),
        calendar_back_dte: env.get("CALENDAR_BACK_DTE", o.calendar_back_dte),
        contract_multiplier: env.get("CONTRACT_MULTIPLIER", o.contract_multiplier),
        strike_step: env.get("STRIKE_STEP", o.strike_step),
        risk_free_rate: env.get("RISK_FREE_RATE", o.risk_free_rate),
        bias_threshold: env.get("OPTIONS_BIAS_THRESHOLD", o.bias_threshold),
        short_wing: o.short_wing,
        width: o.width,
        technical: technical.clone(),
    };

    // ===== Risk =====
    let r = d.risk;
    let risk = RiskLimits {
        max_drawdown: env.get("MAX_DRAWDOWN", r.max_drawdown),
        max_symbol_notional: env.get("MAX_SYMBOL_NOTIONAL", r.max_symbol_notional),
        max_correlated_exposure: env.get("MAX_CORRELATED_EXPOSURE", r.max_correlated_exposure),
        min_position_fraction: env.get("MIN_POSITION_FRACTION", r.min_position_fraction),
        max_position_fraction: env.get("MAX_POSITION_FRACTION", r.max_position_fraction),
        vol_reference: env.get("VOL_REFERENCE", r.vol_reference),
        min_notional: env.get("MIN_NOTIONAL", r.min_notional),
        lot_size: env.get("LOT_SIZE", r.lot_size),
        option_lot_size: env.get("OPTION_LOT_SIZE", r.option_lot_size),
        max_open_positions: env.get("MAX_OPEN_POSITIONS", r.max_open_positions),
        max_portfolio_heat: env.get("MAX_PORTFOLIO_HEAT", r.max_portfolio_heat),
        stop_atr_mult: env.get("STOP_ATR_MULT", r.stop_atr_mult),
        take_atr_mult: env.get("TAKE_ATR_MULT", r.take_atr_mult),
    };
    let correlation = env
        .raw("CORRELATION_GROUPS")
        .map(|s| CorrelationMap::parse(&s))
        .unwrap_or_default();
    let tracker = TrackerCfg {
        max_drawdown: risk.max_drawdown,
        flatten_on_drawdown: env.flag("FLATTEN_ON_DRAWDOWN", d.tracker.flatten_on_drawdown),
    };
    let e = d.exec;
    let exec = ExecCfg {
        timeout_ms: env.get("ORDER_TIMEOUT_MS", e.timeout_ms),
        max_attempts: env.get("MAX_EXEC_ATTEMPTS", e.max_attempts),
        backoff_ms: env.get("EXEC_BACKOFF_MS", e.backoff_ms),
    };

    // ===== Files / ports =====
    let state_dir = cli
        .state_dir
        .clone()
        .or_else(|| env.raw("STATE_DIR").map(PathBuf::from))
        .unwrap_or(d.state_dir);
    let metrics_port = cli.metrics_port.unwrap_or_else(|| env.get("METRICS_PORT", d.metrics_port));

    let settings = Settings {
        symbols,
        feed_mode,
        binance_ws_url,
        mock_feed,
        mock_gateway,
        strategy_names,
        indicators,
        technical,
        options,
        risk,
        correlation,
        tracker,
        exec,
        initial_equity: env.get("INITIAL_EQUITY", d.initial_equity),
        reorder_tolerance_ms: env.get("REORDER_TOLERANCE_MS", d.reorder_tolerance_ms),
        symbol_queue: env.get("SYMBOL_QUEUE", d.symbol_queue).max(1),
        state_dir,
        record_file: env.raw("RECORD_FILE"),
        metrics_port,
        dry_run: cli.dry_run || env.flag("DRY_RUN", false),
    };
    settings.validate()?;
    Ok(settings)
}

/// `.env` (atau `--env-file`) -> environment -> CLI flags.
pub fn load(cli: &Cli) -> Result<Settings, PipelineError> {
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| PipelineError::Config {
                key: "--env-file".into(),
                reason: format!("{}: {}", path.display(), e),
            })?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    from_lookup(|k| env::var(k).ok(), cli)
}
