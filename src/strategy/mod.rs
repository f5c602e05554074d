// ===============================
// src/strategy/mod.rs
// ===============================
//
// SignalGenerator. Setiap varian adalah fungsi murni
// (IndicatorSet, MarketSnapshot) -> Option<Signal>, didaftarkan dalam
// StrategyBook yang dievaluasi berurutan per tick.
//
pub mod greeks;
pub mod options;
pub mod technical;

use crate::domain::{MarketSnapshot, Signal};
use crate::indicators::IndicatorSet;

pub use options::OptionsCfg;
pub use technical::TechnicalCfg;

/// Deterministic: replaying the same tick yields the same id.
pub(crate) fn signal_id(strategy: &str, symbol: &str, ts_ns: i64) -> String {
    format!("{}-{}-{}", strategy, symbol, ts_ns)
}

#[derive(Debug, Clone)]
pub enum Strategy {
    Technical(TechnicalCfg),
    Options(OptionsCfg),
}

impl Strategy {
    pub fn parse_one(s: &str) -> Option<&'static str> {
        match s.trim().to_ascii_lowercase().as_str() {
            "technical" | "tech" | "ta" => Some("technical"),
            "options" | "option" | "opt" => Some("options"),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Strategy::Technical(_) => "technical",
            Strategy::Options(_) => "options",
        }
    }

    pub fn generate(&self, symbol: &str, set: &IndicatorSet, snap: &MarketSnapshot) -> Option<Signal> {
        match self {
            Strategy::Technical(cfg) => technical::generate(self.id(), cfg, symbol, set, snap),
            Strategy::Options(cfg) => options::generate(self.id(), cfg, symbol, set, snap),
        }
    }
}

/// Ordered set of strategies. Every strategy sees the tick; none short-circuits another.
#[derive(Debug, Clone, Default)]
pub struct StrategyBook {
    strategies: Vec<Strategy>,
}

impl StrategyBook {
    pub fn new(strategies: Vec<Strategy>) -> Self {
        Self { strategies }
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.strategies.iter().map(Strategy::id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn evaluate(&self, symbol: &str, set: &IndicatorSet, snap: &MarketSnapshot) -> Vec<Signal> {
        self.strategies
            .iter()
            .filter_map(|s| s.generate(symbol, set, snap))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{IndicatorName, IndicatorValue};

    #[test]
    fn book_collects_from_every_strategy_in_order() {
        let mut set = IndicatorSet::empty("SPY", 5);
        set.insert(IndicatorName::EmaShort, IndicatorValue::Simple(101.0));
        set.insert(IndicatorName::EmaLong, IndicatorValue::Simple(100.0));
        set.insert(IndicatorName::Macd, IndicatorValue::Macd { line: 1.0, signal: 0.5, histogram: 0.5 });
        set.insert(IndicatorName::Rsi, IndicatorValue::Simple(60.0));
        set.insert(IndicatorName::Pivot, IndicatorValue::Pivot { pivot: 99.0, r1: 100.0, s1: 98.0 });
        set.insert(IndicatorName::IvPercentile, IndicatorValue::Simple(0.5));
        let snap = MarketSnapshot {
            ts_ns: 5,
            symbol: "SPY".into(),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 1.0,
            bid: 100.0,
            ask: 100.0,
            implied_vol: Some(0.2),
        };
        let book = StrategyBook::new(vec![
            Strategy::Technical(TechnicalCfg::default()),
            Strategy::Options(OptionsCfg::default()),
        ]);
        let sigs = book.evaluate("SPY", &set, &snap);
        let ids: Vec<&str> = sigs.iter().map(|s| s.strategy.as_str()).collect();
        assert_eq!(ids, vec!["technical", "options"]);
        assert_eq!(sigs[0].id, "technical-SPY-5");
    }

    #[test]
    fn parse_aliases() {
        assert_eq!(Strategy::parse_one(" TA "), Some("technical"));
        assert_eq!(Strategy::parse_one("opt"), Some("options"));
        assert_eq!(Strategy::parse_one("martingale"), None);
    }
}
