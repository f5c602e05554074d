// ===============================
// src/indicators/mod.rs
// ===============================
//
// IndicatorEngine: deterministic, pure function of the rolling window.
// Insufficient history yields `IndicatorValue::NotReady`, never a numeric default,
// so "no signal yet" stays distinguishable from "computed neutral".
//
pub mod calc;

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;

use crate::domain::MarketSnapshot;
use crate::error::ComputationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapPolicy {
    /// Compute on the bars that arrived; gaps shorten effective history.
    Skip,
    /// Insert flat bars at the previous close for up to `max_fill_bars` missing
    /// intervals; a longer gap restarts the series after it.
    ForwardFill,
}

impl GapPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Some(GapPolicy::Skip),
            "forward_fill" | "ffill" | "fill" => Some(GapPolicy::ForwardFill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorCfg {
    pub ema_short: usize,
    pub ema_long: usize,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub atr_period: usize,
    pub bollinger_period: usize,
    pub bollinger_mult: f64,
    pub vol_window: usize,
    pub periods_per_year: f64,
    pub iv_min_samples: usize,
    pub gap_policy: GapPolicy,
    pub bar_interval_ns: i64,
    pub max_fill_bars: usize,
    pub window_len: usize,
}

impl Default for IndicatorCfg {
    fn default() -> Self {
        Self {
            ema_short: 9,
            ema_long: 21,
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            atr_period: 14,
            bollinger_period: 20,
            bollinger_mult: 2.0,
            vol_window: 20,
            // 1m bars, 24/7 market
            periods_per_year: 525_600.0,
            iv_min_samples: 20,
            gap_policy: GapPolicy::Skip,
            bar_interval_ns: 60_000_000_000,
            max_fill_bars: 5,
            window_len: 200,
        }
    }
}

impl IndicatorCfg {
    /// Bars needed before every configured indicator can be ready.
    pub fn lookback(&self) -> usize {
        [
            self.ema_long,
            self.rsi_period + 1,
            self.macd_slow + self.macd_signal - 1,
            self.atr_period + 1,
            self.bollinger_period,
            self.vol_window + 1,
            self.iv_min_samples,
        ]
        .into_iter()
        .max()
        .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorName {
    EmaShort,
    EmaLong,
    Rsi,
    Macd,
    Atr,
    Bollinger,
    Pivot,
    RealizedVol,
    IvPercentile,
}

impl IndicatorName {
    pub const ALL: [IndicatorName; 9] = [
        IndicatorName::EmaShort,
        IndicatorName::EmaLong,
        IndicatorName::Rsi,
        IndicatorName::Macd,
        IndicatorName::Atr,
        IndicatorName::Bollinger,
        IndicatorName::Pivot,
        IndicatorName::RealizedVol,
        IndicatorName::IvPercentile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorName::EmaShort => "ema_short",
            IndicatorName::EmaLong => "ema_long",
            IndicatorName::Rsi => "rsi",
            IndicatorName::Macd => "macd",
            IndicatorName::Atr => "atr",
            IndicatorName::Bollinger => "bollinger",
            IndicatorName::Pivot => "pivot",
            IndicatorName::RealizedVol => "realized_vol",
            IndicatorName::IvPercentile => "iv_percentile",
        }
    }
}

impl fmt::Display for IndicatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IndicatorValue {
    NotReady,
    Simple(f64),
    Macd { line: f64, signal: f64, histogram: f64 },
    Bands { upper: f64, middle: f64, lower: f64 },
    Pivot { pivot: f64, r1: f64, s1: f64 },
}

impl IndicatorValue {
    pub fn is_ready(&self) -> bool {
        !matches!(self, IndicatorValue::NotReady)
    }

    pub fn simple(&self) -> Option<f64> {
        match self {
            IndicatorValue::Simple(v) => Some(*v),
            _ => None,
        }
    }
}

fn ready_or_not<T>(v: Option<T>, f: impl FnOnce(T) -> IndicatorValue) -> IndicatorValue {
    v.map(f).unwrap_or(IndicatorValue::NotReady)
}

/// Indicator values for one symbol at one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSet {
    pub symbol: String,
    pub ts_ns: i64,
    pub bars_used: usize,
    pub bars_filled: usize,
    values: HashMap<IndicatorName, IndicatorValue>,
}

impl IndicatorSet {
    pub fn empty(symbol: &str, ts_ns: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            ts_ns,
            bars_used: 0,
            bars_filled: 0,
            values: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: IndicatorName, value: IndicatorValue) {
        self.values.insert(name, value);
    }

    pub fn get(&self, name: IndicatorName) -> IndicatorValue {
        self.values.get(&name).copied().unwrap_or(IndicatorValue::NotReady)
    }

    pub fn simple(&self, name: IndicatorName) -> Option<f64> {
        self.get(name).simple()
    }

    pub fn ready_count(&self) -> usize {
        self.values.values().filter(|v| v.is_ready()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IndicatorName, IndicatorValue)> + '_ {
        IndicatorName::ALL.into_iter().map(move |n| (n, self.get(n)))
    }
}

/// Bounded rolling window of snapshots for one symbol (oldest first).
#[derive(Debug, Clone)]
pub struct BarWindow {
    cap: usize,
    bars: VecDeque<MarketSnapshot>,
}

impl BarWindow {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { cap, bars: VecDeque::with_capacity(cap) }
    }

    pub fn push(&mut self, snap: MarketSnapshot) {
        if self.bars.len() == self.cap {
            self.bars.pop_front();
        }
        self.bars.push_back(snap);
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&MarketSnapshot> {
        self.bars.back()
    }

    pub fn as_slice(&mut self) -> &[MarketSnapshot] {
        self.bars.make_contiguous()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndicatorEngine {
    cfg: IndicatorCfg,
}

impl IndicatorEngine {
    pub fn new(cfg: IndicatorCfg) -> Self {
        Self { cfg }
    }

    pub fn cfg(&self) -> &IndicatorCfg {
        &self.cfg
    }

    /// Rejects a malformed snapshot before it can poison the window.
    pub fn validate(&self, snap: &MarketSnapshot) -> Result<(), ComputationError> {
        let fields = [
            ("open", snap.open),
            ("high", snap.high),
            ("low", snap.low),
            ("close", snap.close),
            ("volume", snap.volume),
            ("bid", snap.bid),
            ("ask", snap.ask),
            ("implied_vol", snap.implied_vol.unwrap_or(0.0)),
        ];
        for (field, v) in fields {
            if !v.is_finite() {
                return Err(ComputationError::NonFinite {
                    symbol: snap.symbol.clone(),
                    field,
                    ts_ns: snap.ts_ns,
                });
            }
        }
        for price in [snap.open, snap.high, snap.low, snap.close] {
            if price <= 0.0 {
                return Err(ComputationError::NonPositivePrice {
                    symbol: snap.symbol.clone(),
                    price,
                    ts_ns: snap.ts_ns,
                });
            }
        }
        if snap.high < snap.low {
            return Err(ComputationError::InvertedRange {
                symbol: snap.symbol.clone(),
                high: snap.high,
                low: snap.low,
                ts_ns: snap.ts_ns,
            });
        }
        Ok(())
    }

    pub fn compute(
        &self,
        symbol: &str,
        window: &[MarketSnapshot],
    ) -> Result<IndicatorSet, ComputationError> {
        let Some(last) = window.last() else {
            return Ok(IndicatorSet::empty(symbol, 0));
        };

        let mut prev_ts = i64::MIN;
        for snap in window {
            if snap.symbol != symbol {
                return Err(ComputationError::SymbolMismatch {
                    expected: symbol.to_string(),
                    found: snap.symbol.clone(),
                });
            }
            if snap.ts_ns <= prev_ts {
                return Err(ComputationError::Unordered {
                    symbol: symbol.to_string(),
                    ts_ns: snap.ts_ns,
                });
            }
            prev_ts = snap.ts_ns;
            self.validate(snap)?;
        }

        let (bars, filled) = self.apply_gap_policy(window);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let c = &self.cfg;

        let mut set = IndicatorSet::empty(symbol, last.ts_ns);
        set.bars_used = bars.len();
        set.bars_filled = filled;

        set.insert(
            IndicatorName::EmaShort,
            ready_or_not(calc::ema(&closes, c.ema_short), IndicatorValue::Simple),
        );
        set.insert(
            IndicatorName::EmaLong,
            ready_or_not(calc::ema(&closes, c.ema_long), IndicatorValue::Simple),
        );
        set.insert(
            IndicatorName::Rsi,
            ready_or_not(calc::rsi(&closes, c.rsi_period), IndicatorValue::Simple),
        );
        set.insert(
            IndicatorName::Macd,
            ready_or_not(
                calc::macd(&closes, c.macd_fast, c.macd_slow, c.macd_signal),
                |(line, signal, histogram)| IndicatorValue::Macd { line, signal, histogram },
            ),
        );
        set.insert(
            IndicatorName::Atr,
            ready_or_not(calc::atr(&bars, c.atr_period), IndicatorValue::Simple),
        );
        set.insert(
            IndicatorName::Bollinger,
            ready_or_not(
                calc::bollinger(&closes, c.bollinger_period, c.bollinger_mult),
                |(upper, middle, lower)| IndicatorValue::Bands { upper, middle, lower },
            ),
        );
        set.insert(
            IndicatorName::Pivot,
            ready_or_not(calc::pivot(&bars), |(pivot, r1, s1)| IndicatorValue::Pivot {
                pivot,
                r1,
                s1,
            }),
        );
        set.insert(
            IndicatorName::RealizedVol,
            ready_or_not(
                calc::realized_vol(&closes, c.vol_window, c.periods_per_year),
                IndicatorValue::Simple,
            ),
        );

        // IV rank only makes sense if the current bar carries an IV.
        let ivs: Vec<f64> = bars.iter().filter_map(|b| b.implied_vol).collect();
        let iv_rank = match last.implied_vol {
            Some(cur) if ivs.len() >= c.iv_min_samples.max(1) => calc::percentile_rank(&ivs, cur),
            _ => None,
        };
        set.insert(IndicatorName::IvPercentile, ready_or_not(iv_rank, IndicatorValue::Simple));

        Ok(set)
    }

    fn apply_gap_policy<'a>(&self, window: &'a [MarketSnapshot]) -> (Cow<'a, [MarketSnapshot]>, usize) {
        let interval = self.cfg.bar_interval_ns;
        if self.cfg.gap_policy == GapPolicy::Skip || interval <= 0 || window.len() < 2 {
            return (Cow::Borrowed(window), 0);
        }

        let mut out: Vec<MarketSnapshot> = Vec::with_capacity(window.len());
        let mut filled = 0usize;
        for snap in window {
            if let Some(prev) = out.last().cloned() {
                let delta = snap.ts_ns - prev.ts_ns;
                if delta * 2 > interval * 3 {
                    let missing = ((delta as f64 / interval as f64).round() as i64 - 1).max(0) as usize;
                    if missing > self.cfg.max_fill_bars {
                        out.clear();
                    } else {
                        for k in 1..=missing {
                            out.push(MarketSnapshot {
                                ts_ns: prev.ts_ns + k as i64 * interval,
                                open: prev.close,
                                high: prev.close,
                                low: prev.close,
                                volume: 0.0,
                                ..prev.clone()
                            });
                        }
                        filled += missing;
                    }
                }
            }
            out.push(snap.clone());
        }

        if out.len() > self.cfg.window_len {
            let excess = out.len() - self.cfg.window_len;
            out.drain(..excess);
        }
        (Cow::Owned(out), filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000_000_000;

    fn snap(i: i64, close: f64) -> MarketSnapshot {
        MarketSnapshot {
            ts_ns: i * MIN,
            symbol: "AAPL".into(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            bid: close - 0.01,
            ask: close + 0.01,
            implied_vol: Some(0.2 + (i % 7) as f64 * 0.01),
        }
    }

    fn series(n: i64) -> Vec<MarketSnapshot> {
        (0..n).map(|i| snap(i, 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1)).collect()
    }

    #[test]
    fn short_history_is_not_ready_not_zero() {
        let engine = IndicatorEngine::default();
        let set = engine.compute("AAPL", &series(5)).unwrap();
        assert_eq!(set.get(IndicatorName::EmaLong), IndicatorValue::NotReady);
        assert_eq!(set.get(IndicatorName::Macd), IndicatorValue::NotReady);
        assert_eq!(set.get(IndicatorName::Atr), IndicatorValue::NotReady);
        assert!(set.get(IndicatorName::Pivot).is_ready());
    }

    #[test]
    fn full_history_is_ready() {
        let engine = IndicatorEngine::default();
        let set = engine.compute("AAPL", &series(60)).unwrap();
        for (name, value) in set.iter() {
            assert!(value.is_ready(), "{name} should be ready");
        }
    }

    #[test]
    fn compute_is_deterministic() {
        let engine = IndicatorEngine::default();
        let bars = series(80);
        assert_eq!(engine.compute("AAPL", &bars).unwrap(), engine.compute("AAPL", &bars).unwrap());
    }

    #[test]
    fn empty_window_yields_empty_set() {
        let set = IndicatorEngine::default().compute("AAPL", &[]).unwrap();
        assert_eq!(set.ready_count(), 0);
    }

    #[test]
    fn malformed_bar_is_a_computation_error() {
        let engine = IndicatorEngine::default();
        let mut bars = series(30);
        bars[10].close = f64::NAN;
        assert!(matches!(
            engine.compute("AAPL", &bars),
            Err(ComputationError::NonFinite { field: "close", .. })
        ));
        let mut bars = series(30);
        bars[3].high = 1.0;
        assert!(matches!(
            engine.compute("AAPL", &bars),
            Err(ComputationError::InvertedRange { .. })
        ));
    }

    #[test]
    fn foreign_symbol_is_rejected() {
        let engine = IndicatorEngine::default();
        let mut bars = series(10);
        bars[4].symbol = "MSFT".into();
        assert!(matches!(
            engine.compute("AAPL", &bars),
            Err(ComputationError::SymbolMismatch { .. })
        ));
    }

    #[test]
    fn forward_fill_inserts_missing_bars() {
        let engine = IndicatorEngine::new(IndicatorCfg {
            gap_policy: GapPolicy::ForwardFill,
            ..IndicatorCfg::default()
        });
        // bars 0..10 then 13..20: three missing minutes
        let bars: Vec<MarketSnapshot> = (0..10).chain(13..20).map(|i| snap(i, 100.0)).collect();
        let set = engine.compute("AAPL", &bars).unwrap();
        assert_eq!(set.bars_filled, 3);
        assert_eq!(set.bars_used, 20);
    }

    #[test]
    fn long_gap_restarts_history() {
        let engine = IndicatorEngine::new(IndicatorCfg {
            gap_policy: GapPolicy::ForwardFill,
            max_fill_bars: 2,
            ..IndicatorCfg::default()
        });
        let bars: Vec<MarketSnapshot> = (0..40).chain(100..105).map(|i| snap(i, 100.0)).collect();
        let set = engine.compute("AAPL", &bars).unwrap();
        assert_eq!(set.bars_used, 5);
        assert_eq!(set.get(IndicatorName::Rsi), IndicatorValue::NotReady);
    }

    #[test]
    fn skip_policy_keeps_bars_as_is() {
        let engine = IndicatorEngine::default();
        let bars: Vec<MarketSnapshot> = (0..10).chain(13..20).map(|i| snap(i, 100.0)).collect();
        let set = engine.compute("AAPL", &bars).unwrap();
        assert_eq!(set.bars_filled, 0);
        assert_eq!(set.bars_used, 17);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut w = BarWindow::new(3);
        for i in 0..5 {
            w.push(snap(i, 100.0));
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.as_slice()[0].ts_ns, 2 * MIN);
    }

    #[test]
    fn lookback_covers_macd() {
        assert_eq!(IndicatorCfg::default().lookback(), 34);
    }
}
