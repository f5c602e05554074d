// ===============================
// src/strategy/options.rs
// ===============================
//
// Options variant: IV regime x directional bias -> one defined-risk structure.
//
//   IV bucket | bullish        | bearish        | neutral
//   ----------+----------------+----------------+---------------------
//   High      | BullPutSpread  | BearCallSpread | IronCondor
//   Normal    | BullCallSpread | BearPutSpread  | IronCondor, Calendar
//   Low       | BullCallSpread | BearPutSpread  | Calendar
//
// Tidak pernah membeli single long option. Jika lebih dari satu struktur lolos,
// prioritas: Vertical > IronCondor > Calendar.
//
use chrono::{Days, NaiveDate, TimeZone, Utc};

use crate::domain::{
    Instrument, LegSide, MarketSnapshot, OptionLeg, OptionRight, OptionsStructure, Signal,
    StructureFamily,
};
use crate::indicators::{IndicatorName, IndicatorSet};

use super::greeks::bs_delta;
use super::signal_id;
use super::technical::{self, TechnicalCfg};

#[derive(Debug, Clone)]
pub struct OptionsCfg {
    /// IV percentile at or below -> Low bucket.
    pub iv_low_pct: f64,
    /// IV percentile at or above -> High bucket.
    pub iv_high_pct: f64,
    pub target_dte: u32,
    pub calendar_back_dte: u32,
    pub contract_multiplier: f64,
    pub strike_step: f64,
    pub risk_free_rate: f64,
    /// |technical score| above this is a directional bias.
    pub bias_threshold: f64,
    /// Short strike distance for credit structures, in expected-move units.
    pub short_wing: f64,
    /// Spread width, in expected-move units (at least one strike step).
    pub width: f64,
    pub technical: TechnicalCfg,
}

impl Default for OptionsCfg {
    fn default() -> Self {
        Self {
            iv_low_pct: 0.25,
            iv_high_pct: 0.75,
            target_dte: 30,
            calendar_back_dte: 60,
            contract_multiplier: 1.0,
            strike_step: 1.0,
            risk_free_rate: 0.04,
            bias_threshold: 0.2,
            short_wing: 1.0,
            width: 0.5,
            technical: TechnicalCfg::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvBucket {
    Low,
    Normal,
    High,
}

impl IvBucket {
    pub fn classify(percentile: f64, cfg: &OptionsCfg) -> Self {
        if percentile >= cfg.iv_high_pct {
            IvBucket::High
        } else if percentile <= cfg.iv_low_pct {
            IvBucket::Low
        } else {
            IvBucket::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    pub fn from_score(score: f64, threshold: f64) -> Self {
        if score > threshold {
            Bias::Bullish
        } else if score < -threshold {
            Bias::Bearish
        } else {
            Bias::Neutral
        }
    }
}

/// Every structure that qualifies for this regime.
pub fn candidates(bucket: IvBucket, bias: Bias) -> Vec<OptionsStructure> {
    use OptionsStructure::*;
    match (bucket, bias) {
        (IvBucket::High, Bias::Bullish) => vec![BullPutSpread],
        (IvBucket::High, Bias::Bearish) => vec![BearCallSpread],
        (IvBucket::High, Bias::Neutral) => vec![IronCondor],
        (_, Bias::Bullish) => vec![BullCallSpread],
        (_, Bias::Bearish) => vec![BearPutSpread],
        (IvBucket::Normal, Bias::Neutral) => vec![IronCondor, CalendarSpread],
        (IvBucket::Low, Bias::Neutral) => vec![CalendarSpread],
    }
}

fn family_rank(f: StructureFamily) -> u8 {
    match f {
        StructureFamily::Vertical => 0,
        StructureFamily::IronCondor => 1,
        StructureFamily::Calendar => 2,
    }
}

pub fn select(bucket: IvBucket, bias: Bias) -> Option<OptionsStructure> {
    candidates(bucket, bias)
        .into_iter()
        .min_by_key(|s| family_rank(s.family()))
}

fn round_strike(x: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return x;
    }
    ((x / step).round() * step).max(step)
}

struct LegBuilder<'a> {
    cfg: &'a OptionsCfg,
    spot: f64,
    iv: f64,
    today: NaiveDate,
}

impl LegBuilder<'_> {
    fn leg(&self, right: OptionRight, side: LegSide, strike: f64, dte: u32) -> Option<OptionLeg> {
        let expiry = self.today.checked_add_days(Days::new(dte as u64))?;
        let t = dte as f64 / 365.0;
        Some(OptionLeg {
            right,
            side,
            strike,
            expiry,
            days_to_expiry: dte,
            delta: bs_delta(right, self.spot, strike, t, self.iv, self.cfg.risk_free_rate),
        })
    }

    fn build(&self, structure: OptionsStructure) -> Option<Vec<OptionLeg>> {
        let c = self.cfg;
        let dte = c.target_dte.max(1);
        let em = self.spot * self.iv * (dte as f64 / 365.0).sqrt();
        let step = c.strike_step;
        let width = round_strike(em * c.width, step).max(step);
        let atm = round_strike(self.spot, step);
        let put_short = round_strike(self.spot - em * c.short_wing, step);
        let call_short = round_strike(self.spot + em * c.short_wing, step);

        use LegSide::{Buy, Sell};
        use OptionRight::{Call, Put};
        let legs = match structure {
            OptionsStructure::BullCallSpread => vec![
                self.leg(Call, Buy, atm, dte)?,
                self.leg(Call, Sell, atm + width, dte)?,
            ],
            OptionsStructure::BearPutSpread => vec![
                self.leg(Put, Buy, atm, dte)?,
                self.leg(Put, Sell, (atm - width).max(step), dte)?,
            ],
            OptionsStructure::BullPutSpread => vec![
                self.leg(Put, Sell, put_short, dte)?,
                self.leg(Put, Buy, (put_short - width).max(step), dte)?,
            ],
            OptionsStructure::BearCallSpread => vec![
                self.leg(Call, Sell, call_short, dte)?,
                self.leg(Call, Buy, call_short + width, dte)?,
            ],
            OptionsStructure::IronCondor => vec![
                self.leg(Put, Buy, (put_short - width).max(step), dte)?,
                self.leg(Put, Sell, put_short, dte)?,
                self.leg(Call, Sell, call_short, dte)?,
                self.leg(Call, Buy, call_short + width, dte)?,
            ],
            OptionsStructure::CalendarSpread => {
                let back = c.calendar_back_dte.max(dte + 1);
                vec![self.leg(Call, Sell, atm, dte)?, self.leg(Call, Buy, atm, back)?]
            }
        };
        Some(legs)
    }
}

pub fn generate(
    id: &str,
    cfg: &OptionsCfg,
    symbol: &str,
    set: &IndicatorSet,
    snap: &MarketSnapshot,
) -> Option<Signal> {
    let iv = snap.implied_vol.filter(|v| *v > 0.0)?;
    let pct = set.simple(IndicatorName::IvPercentile)?;

    let v = technical::vote(&cfg.technical, set, snap.close);
    if v.ready < cfg.technical.min_agree {
        return None;
    }
    let bucket = IvBucket::classify(pct, cfg);
    let bias = Bias::from_score(v.score, cfg.bias_threshold);
    let structure = select(bucket, bias)?;

    let today = Utc.timestamp_nanos(snap.ts_ns).date_naive();
    let builder = LegBuilder { cfg, spot: snap.close, iv, today };
    let legs = builder.build(structure)?;
    let net_delta: f64 = legs.iter().map(|l| l.side.sign() * l.delta).sum();

    let confidence = match bias {
        Bias::Neutral if cfg.bias_threshold > 0.0 => 1.0 - v.score.abs() / cfg.bias_threshold,
        Bias::Neutral => 1.0,
        _ => v.score.abs(),
    }
    .clamp(0.0, 1.0);
    if confidence <= 0.0 {
        return None;
    }

    let supporting = vec![
        ("iv".to_string(), iv),
        ("iv_percentile".to_string(), pct),
        ("score".to_string(), v.score),
        ("net_delta".to_string(), net_delta),
    ];

    Some(Signal {
        id: signal_id(id, symbol, snap.ts_ns),
        strategy: id.to_string(),
        symbol: symbol.to_string(),
        direction: structure.direction(),
        instrument: Instrument::Options {
            structure,
            legs,
            net_delta,
            multiplier: cfg.contract_multiplier,
        },
        confidence,
        price: snap.close,
        atr: set.simple(IndicatorName::Atr),
        realized_vol: set.simple(IndicatorName::RealizedVol),
        supporting,
        ts_ns: snap.ts_ns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use crate::indicators::IndicatorValue;

    fn set(bull: bool, iv_pct: f64) -> IndicatorSet {
        let (s, l, h, rsi, piv) = if bull {
            (101.0, 100.0, 0.5, 55.0, 99.0)
        } else {
            (99.0, 100.0, -0.5, 45.0, 101.0)
        };
        let mut set = IndicatorSet::empty("SPY", 0);
        set.insert(IndicatorName::EmaShort, IndicatorValue::Simple(s));
        set.insert(IndicatorName::EmaLong, IndicatorValue::Simple(l));
        set.insert(IndicatorName::Macd, IndicatorValue::Macd { line: h, signal: 0.0, histogram: h });
        set.insert(IndicatorName::Rsi, IndicatorValue::Simple(rsi));
        set.insert(IndicatorName::Pivot, IndicatorValue::Pivot { pivot: piv, r1: piv + 1.0, s1: piv - 1.0 });
        set.insert(IndicatorName::Atr, IndicatorValue::Simple(1.5));
        set.insert(IndicatorName::IvPercentile, IndicatorValue::Simple(iv_pct));
        set
    }

    fn snap(iv: Option<f64>) -> MarketSnapshot {
        MarketSnapshot {
            ts_ns: 1_700_000_000_000_000_000,
            symbol: "SPY".into(),
            open: 100.0,
            high: 100.5,
            low: 99.5,
            close: 100.0,
            volume: 1.0,
            bid: 99.99,
            ask: 100.01,
            implied_vol: iv,
        }
    }

    #[test]
    fn selection_table() {
        use OptionsStructure::*;
        assert_eq!(select(IvBucket::High, Bias::Bullish), Some(BullPutSpread));
        assert_eq!(select(IvBucket::High, Bias::Bearish), Some(BearCallSpread));
        assert_eq!(select(IvBucket::High, Bias::Neutral), Some(IronCondor));
        assert_eq!(select(IvBucket::Normal, Bias::Neutral), Some(IronCondor));
        assert_eq!(select(IvBucket::Low, Bias::Neutral), Some(CalendarSpread));
        assert_eq!(select(IvBucket::Low, Bias::Bullish), Some(BullCallSpread));
    }

    #[test]
    fn every_structure_has_a_short_leg() {
        let cfg = OptionsCfg::default();
        let b = LegBuilder {
            cfg: &cfg,
            spot: 100.0,
            iv: 0.3,
            today: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        };
        use OptionsStructure::*;
        for s in [BullCallSpread, BearPutSpread, BullPutSpread, BearCallSpread, IronCondor, CalendarSpread] {
            let legs = b.build(s).unwrap();
            assert!(legs.len() >= 2, "{s:?}");
            assert!(legs.iter().any(|l| l.side == LegSide::Sell), "{s:?}");
        }
    }

    #[test]
    fn high_iv_bullish_is_credit_put_spread() {
        let cfg = OptionsCfg::default();
        let sig = generate("options", &cfg, "SPY", &set(true, 0.9), &snap(Some(0.35))).unwrap();
        assert_eq!(sig.direction, Direction::Long);
        match &sig.instrument {
            Instrument::Options { structure, legs, net_delta, .. } => {
                assert_eq!(*structure, OptionsStructure::BullPutSpread);
                assert!(structure.is_credit());
                let short = legs.iter().find(|l| l.side == LegSide::Sell).unwrap();
                let long = legs.iter().find(|l| l.side == LegSide::Buy).unwrap();
                assert!(short.strike > long.strike);
                assert!(short.strike < 100.0);
                assert!(*net_delta > 0.0);
            }
            other => panic!("unexpected instrument {other:?}"),
        }
    }

    #[test]
    fn low_iv_bearish_is_debit_put_spread() {
        let cfg = OptionsCfg::default();
        let sig = generate("options", &cfg, "SPY", &set(false, 0.1), &snap(Some(0.15))).unwrap();
        assert_eq!(sig.direction, Direction::Short);
        assert!(matches!(
            sig.instrument,
            Instrument::Options { structure: OptionsStructure::BearPutSpread, .. }
        ));
    }

    #[test]
    fn missing_iv_means_no_signal() {
        let cfg = OptionsCfg::default();
        assert!(generate("options", &cfg, "SPY", &set(true, 0.9), &snap(None)).is_none());
        let mut s = set(true, 0.9);
        s.insert(IndicatorName::IvPercentile, IndicatorValue::NotReady);
        assert!(generate("options", &cfg, "SPY", &s, &snap(Some(0.3))).is_none());
    }

    #[test]
    fn calendar_back_month_is_later() {
        let cfg = OptionsCfg::default();
        let b = LegBuilder {
            cfg: &cfg,
            spot: 100.0,
            iv: 0.2,
            today: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        };
        let legs = b.build(OptionsStructure::CalendarSpread).unwrap();
        assert!(legs[1].expiry > legs[0].expiry);
        assert_eq!(legs[0].strike, legs[1].strike);
    }
}
