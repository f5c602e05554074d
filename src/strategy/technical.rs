// ===============================
// src/strategy/technical.rs
// ===============================
//
// Weighted vote over four components:
//   trend    : EMA short vs EMA long
//   macd     : sign of the MACD histogram
//   momentum : RSI (oversold -> bullish, overbought -> bearish, else side of 50)
//   pivot    : close above/below the floor pivot
// Score = sum(w * vote) / sum(all weights). Components that are not ready abstain
// (vote 0) but still count in the denominator, so thin history weakens the score.
//
use crate::domain::{Direction, Instrument, MarketSnapshot, Signal};
use crate::indicators::{IndicatorName, IndicatorSet, IndicatorValue};

use super::signal_id;

#[derive(Debug, Clone)]
pub struct TechnicalCfg {
    pub weight_trend: f64,
    pub weight_macd: f64,
    pub weight_momentum: f64,
    pub weight_pivot: f64,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    /// |score| must be strictly above this.
    pub vote_threshold: f64,
    /// Minimum components voting with the score's sign.
    pub min_agree: usize,
}

impl Default for TechnicalCfg {
    fn default() -> Self {
        Self {
            weight_trend: 0.3,
            weight_macd: 0.3,
            weight_momentum: 0.2,
            weight_pivot: 0.2,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            vote_threshold: 0.3,
            min_agree: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub score: f64,
    pub agreeing: usize,
    pub ready: usize,
    pub components: Vec<(String, f64)>,
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

pub fn vote(cfg: &TechnicalCfg, set: &IndicatorSet, close: f64) -> Vote {
    let trend = match (set.simple(IndicatorName::EmaShort), set.simple(IndicatorName::EmaLong)) {
        (Some(s), Some(l)) => Some(sign(s - l)),
        _ => None,
    };
    let macd = match set.get(IndicatorName::Macd) {
        IndicatorValue::Macd { histogram, .. } => Some(sign(histogram)),
        _ => None,
    };
    let momentum = set.simple(IndicatorName::Rsi).map(|rsi| {
        if rsi <= cfg.rsi_oversold {
            1.0
        } else if rsi >= cfg.rsi_overbought {
            -1.0
        } else {
            sign(rsi - 50.0)
        }
    });
    let pivot = match set.get(IndicatorName::Pivot) {
        IndicatorValue::Pivot { pivot, .. } => Some(sign(close - pivot)),
        _ => None,
    };

    let parts = [
        ("trend", cfg.weight_trend, trend),
        ("macd", cfg.weight_macd, macd),
        ("momentum", cfg.weight_momentum, momentum),
        ("pivot", cfg.weight_pivot, pivot),
    ];
    let total_w: f64 = parts.iter().map(|(_, w, _)| w.max(0.0)).sum();
    let weighted: f64 = parts.iter().map(|(_, w, v)| w.max(0.0) * v.unwrap_or(0.0)).sum();
    let score = if total_w > 0.0 { weighted / total_w } else { 0.0 };

    let s = sign(score);
    let agreeing = parts
        .iter()
        .filter(|(_, _, v)| s != 0.0 && v.map(sign) == Some(s))
        .count();
    let ready = parts.iter().filter(|(_, _, v)| v.is_some()).count();
    let components = parts
        .iter()
        .filter_map(|(name, _, v)| v.map(|v| (name.to_string(), v)))
        .collect();

    Vote { score, agreeing, ready, components }
}

pub fn generate(
    id: &str,
    cfg: &TechnicalCfg,
    symbol: &str,
    set: &IndicatorSet,
    snap: &MarketSnapshot,
) -> Option<Signal> {
    let v = vote(cfg, set, snap.close);
    // ties (score 0) are neutral: nothing to trade
    if v.score == 0.0 || v.score.abs() <= cfg.vote_threshold || v.agreeing < cfg.min_agree {
        return None;
    }
    let direction = if v.score > 0.0 { Direction::Long } else { Direction::Short };

    let mut supporting = v.components;
    supporting.push(("score".into(), v.score));
    for name in [IndicatorName::EmaShort, IndicatorName::EmaLong, IndicatorName::Rsi] {
        if let Some(x) = set.simple(name) {
            supporting.push((name.to_string(), x));
        }
    }

    Some(Signal {
        id: signal_id(id, symbol, snap.ts_ns),
        strategy: id.to_string(),
        symbol: symbol.to_string(),
        direction,
        instrument: Instrument::Equity,
        confidence: v.score.abs().min(1.0),
        price: snap.close,
        atr: set.simple(IndicatorName::Atr),
        realized_vol: set.simple(IndicatorName::RealizedVol),
        supporting,
        ts_ns: snap.ts_ns,
    })
}
