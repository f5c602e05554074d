// ===============================
// src/risk.rs
// ===============================
//
// RiskManager: Signal[] + PortfolioState (read-only) -> TradeIntent[].
//
// Urutan per simbol:
//   halted? -> konflik arah? -> pilih sinyal primer -> volatilitas ada? -> sizing
//   -> gate (a) drawdown (b) cap simbol (c) cap korelasi (d) min notional/lot
//      (e) max posisi terbuka (f) portfolio heat
// Gagal di salah satu gate = reject dengan reason code; tidak ada efek samping.
//
use ahash::AHashMap as HashMap;
use tracing::{debug, info};

use crate::domain::{
    next_id, Bracket, Direction, Instrument, IntentAction, OrderType, Signal, TradeIntent,
};
use crate::error::RejectReason;
use crate::positions::PortfolioState;

#[derive(Clone, Debug)]
pub struct RiskLimits {
    pub max_drawdown: f64,
    pub max_symbol_notional: f64,
    /// Fraction of total equity allowed in one correlation group.
    pub max_correlated_exposure: f64,
    pub min_position_fraction: f64,
    pub max_position_fraction: f64,
    /// Annualized vol at which the size factor is one half.
    pub vol_reference: f64,
    pub min_notional: f64,
    pub lot_size: f64,
    pub option_lot_size: f64,
    pub max_open_positions: usize,
    pub max_portfolio_heat: f64,
    pub stop_atr_mult: f64,
    pub take_atr_mult: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_drawdown: 0.10,
            max_symbol_notional: 20_000.0,
            max_correlated_exposure: 0.30,
            min_position_fraction: 0.01,
            max_position_fraction: 0.10,
            vol_reference: 0.30,
            min_notional: 10.0,
            lot_size: 0.001,
            option_lot_size: 0.1,
            max_open_positions: 5,
            max_portfolio_heat: 0.06,
            stop_atr_mult: 2.0,
            take_atr_mult: 3.0,
        }
    }
}

// longest first: FDUSD/BUSD before USD
const QUOTE_ASSETS: [&str; 5] = ["FDUSD", "USDT", "USDC", "BUSD", "USD"];

/// symbol -> correlation group. Unmapped symbols fall back to their base asset.
#[derive(Clone, Debug, Default)]
pub struct CorrelationMap {
    groups: HashMap<String, String>,
}

impl CorrelationMap {
    pub fn new(groups: HashMap<String, String>) -> Self {
        Self { groups }
    }

    /// `BTCUSDT=crypto,ETHUSDT=crypto`
    pub fn parse(s: &str) -> Self {
        let groups = s
            .split(',')
            .filter_map(|pair| {
                let (sym, grp) = pair.split_once('=')?;
                let (sym, grp) = (sym.trim(), grp.trim());
                if sym.is_empty() || grp.is_empty() {
                    return None;
                }
                Some((sym.to_ascii_uppercase(), grp.to_string()))
            })
            .collect();
        Self { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Explicit mapping first, otherwise the base asset:
    /// `BTC-USD`, `BTC/USDT`, `BTCUSDT` and `BTCUSDC` all land in `BTC`.
    pub fn group_of(&self, symbol: &str) -> String {
        if let Some(g) = self.groups.get(symbol) {
            return g.clone();
        }
        let pair = symbol
            .split(['/', '-'])
            .next()
            .filter(|b| !b.is_empty())
            .unwrap_or(symbol)
            .to_ascii_uppercase();
        QUOTE_ASSETS
            .iter()
            .find_map(|q| pair.strip_suffix(q).filter(|base| !base.is_empty()))
            .unwrap_or(&pair)
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub symbol: String,
    pub signal_ids: Vec<String>,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub approved: Vec<TradeIntent>,
    pub rejected: Vec<Rejection>,
}

/// Size before the caps: equity x fraction(confidence) x vol factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sizing {
    pub fraction: f64,
    pub vol_factor: f64,
    pub notional: f64,
    pub units: f64,
}

#[derive(Clone, Debug)]
pub struct RiskManager {
    limits: RiskLimits,
    groups: CorrelationMap,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, groups: CorrelationMap) -> Self {
        Self { limits, groups }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn group_of(&self, symbol: &str) -> String {
        self.groups.group_of(symbol)
    }

    /// Higher vol strictly shrinks size; confidence scales linearly in [min, max] fraction.
    pub fn size(&self, equity: f64, signal: &Signal, vol: f64) -> Sizing {
        let l = &self.limits;
        let conf = signal.confidence.clamp(0.0, 1.0);
        let fraction = l.min_position_fraction + (l.max_position_fraction - l.min_position_fraction) * conf;
        let vol_factor = l.vol_reference / (l.vol_reference + vol.max(0.0));
        let notional = equity.max(0.0) * fraction * vol_factor;

        let per_unit = signal.instrument.exposure_per_unit(signal.price);
        let lot = match signal.instrument {
            Instrument::Equity => l.lot_size,
            Instrument::Options { .. } => l.option_lot_size,
        };
        let raw = if per_unit > 0.0 { notional / per_unit } else { 0.0 };
        let units = if lot > 0.0 { (raw / lot + 1e-9).floor() * lot } else { raw };
        Sizing { fraction, vol_factor, notional, units }
    }

    fn bracket(&self, direction: Direction, price: f64, atr: f64) -> Bracket {
        let (k_sl, k_tp) = (self.limits.stop_atr_mult, self.limits.take_atr_mult);
        match direction {
            Direction::Long => Bracket::Directional {
                stop_loss: price - k_sl * atr,
                take_profit: price + k_tp * atr,
            },
            Direction::Short => Bracket::Directional {
                stop_loss: price + k_sl * atr,
                take_profit: price - k_tp * atr,
            },
            Direction::Neutral => Bracket::Range {
                lower: price - k_sl * atr,
                upper: price + k_sl * atr,
            },
        }
    }

    pub fn evaluate(&self, signals: &[Signal], state: &PortfolioState) -> Evaluation {
        let mut out = Evaluation::default();

        // group by symbol, first-seen order
        let mut order: Vec<&str> = Vec::new();
        let mut by_symbol: HashMap<&str, Vec<&Signal>> = HashMap::new();
        for s in signals {
            let entry = by_symbol.entry(s.symbol.as_str()).or_default();
            if entry.is_empty() {
                order.push(s.symbol.as_str());
            }
            entry.push(s);
        }

        // batch-local additions so two approvals in one call see each other
        let mut added_symbol: HashMap<String, f64> = HashMap::new();
        let mut added_group: HashMap<String, f64> = HashMap::new();
        let mut added_dirs: HashMap<String, Vec<Direction>> = HashMap::new();
        let mut added_count = 0usize;
        let mut added_risk = 0.0f64;

        for symbol in order {
            let Some(group_signals) = by_symbol.get(symbol) else {
                continue;
            };
            let ids: Vec<String> = group_signals.iter().map(|s| s.id.clone()).collect();
            let reject = |out: &mut Evaluation, reason: RejectReason| {
                info!(%symbol, code = reason.code(), %reason, "risk rejected");
                out.rejected.push(Rejection {
                    symbol: symbol.to_string(),
                    signal_ids: ids.clone(),
                    reason,
                });
            };

            if let Some(why) = &state.halted {
                reject(&mut out, RejectReason::Halted(why.clone()));
                continue;
            }

            // (a) drawdown, ahead of anything signal-specific
            let dd = state.drawdown();
            if dd >= self.limits.max_drawdown {
                reject(&mut out, RejectReason::DrawdownBreach { drawdown: dd, limit: self.limits.max_drawdown });
                continue;
            }

            let group = self.groups.group_of(symbol);
            let held_dirs: Vec<Direction> = state
                .group_directions(&group)
                .into_iter()
                .chain(added_dirs.get(&group).into_iter().flatten().copied())
                .collect();
            let conflict = group_signals.iter().any(|a| {
                group_signals.iter().any(|b| a.direction.conflicts_with(b.direction))
                    || held_dirs.iter().any(|d| a.direction.conflicts_with(*d))
            });
            if conflict {
                reject(&mut out, RejectReason::DirectionConflict);
                continue;
            }

            // primary = highest confidence; ties keep registration order
            let Some(primary) = group_signals.iter().copied().reduce(|best, s| {
                if s.confidence > best.confidence { s } else { best }
            }) else {
                continue;
            };

            let (Some(atr), Some(vol)) = (
                primary.atr.filter(|a| a.is_finite() && *a > 0.0),
                primary.realized_vol.filter(|v| v.is_finite()),
            ) else {
                reject(&mut out, RejectReason::VolatilityUnavailable);
                continue;
            };

            let equity = state.total_equity();
            let sizing = self.size(equity, primary, vol);
            let per_unit = primary.instrument.exposure_per_unit(primary.price);
            let notional = sizing.units * per_unit;

            // (b) per-symbol cap
            let sym_exp = state.symbol_exposure(symbol) + added_symbol.get(symbol).copied().unwrap_or(0.0);
            if sym_exp + notional > self.limits.max_symbol_notional {
                reject(
                    &mut out,
                    RejectReason::SymbolExposureCap { exposure: sym_exp + notional, cap: self.limits.max_symbol_notional },
                );
                continue;
            }

            // (c) correlation cap
            let grp_exp = state.group_exposure(&group) + added_group.get(&group).copied().unwrap_or(0.0);
            let grp_cap = self.limits.max_correlated_exposure * equity;
            if grp_exp + notional > grp_cap {
                reject(
                    &mut out,
                    RejectReason::CorrelationCap { group: group.clone(), exposure: grp_exp + notional, cap: grp_cap },
                );
                continue;
            }

            // (d) min notional / lot
            if sizing.units <= 0.0 || notional < self.limits.min_notional {
                reject(&mut out, RejectReason::BelowMinimum { notional, minimum: self.limits.min_notional });
                continue;
            }

            // (e) open positions
            let open = state.open_count() + added_count;
            if open >= self.limits.max_open_positions {
                reject(&mut out, RejectReason::MaxOpenPositions { open, max: self.limits.max_open_positions });
                continue;
            }

            // (f) heat
            let bracket = self.bracket(primary.direction, primary.price, atr);
            let risk = bracket.stop_distance(primary.price)
                * primary.instrument.pnl_per_point(primary.direction).abs()
                * sizing.units;
            let heat = if equity > 0.0 {
                state.heat() + (added_risk + risk) / equity
            } else {
                f64::INFINITY
            };
            if heat > self.limits.max_portfolio_heat {
                reject(&mut out, RejectReason::PortfolioHeat { heat, max: self.limits.max_portfolio_heat });
                continue;
            }

            *added_symbol.entry(symbol.to_string()).or_default() += notional;
            *added_group.entry(group.clone()).or_default() += notional;
            added_dirs.entry(group.clone()).or_default().push(primary.direction);
            added_count += 1;
            added_risk += risk;

            let intent = TradeIntent {
                id: next_id("IN", primary.ts_ns),
                symbol: symbol.to_string(),
                group,
                instrument: primary.instrument.clone(),
                direction: primary.direction,
                action: IntentAction::Open { bracket },
                size: sizing.units,
                order_type: OrderType::Limit { price: primary.price },
                ref_price: primary.price,
                signal_ids: ids.clone(),
                annotations: vec![
                    format!("primary={} conf={:.3}", primary.strategy, primary.confidence),
                    format!(
                        "fraction={:.4} vol={:.4} vol_factor={:.4} notional={:.2}",
                        sizing.fraction, vol, sizing.vol_factor, notional
                    ),
                    format!("atr={:.4} bracket={:?}", atr, bracket),
                    format!("drawdown={:.4} symbol_exposure={:.2} group_exposure={:.2} heat={:.4}", dd, sym_exp + notional, grp_exp + notional, heat),
                ],
                ts_ns: primary.ts_ns,
            };
            debug!(%symbol, intent = %intent.id, size = intent.size, notional, "risk approved");
            out.approved.push(intent);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(id: &str, symbol: &str, dir: Direction, conf: f64) -> Signal {
        Signal {
            id: id.into(),
            strategy: "technical".into(),
            symbol: symbol.into(),
            direction: dir,
            instrument: Instrument::Equity,
            confidence: conf,
            price: 100.0,
            atr: Some(1.0),
            realized_vol: Some(0.3),
            supporting: vec![],
            ts_ns: 1,
        }
    }

    fn rm() -> RiskManager {
        RiskManager::new(RiskLimits::default(), CorrelationMap::default())
    }

    #[test]
    fn sizing_is_inverse_in_vol_and_linear_in_confidence() {
        let rm = rm();
        let s = sig("a", "X", Direction::Long, 0.5);
        let calm = rm.size(100_000.0, &s, 0.1);
        let wild = rm.size(100_000.0, &s, 0.9);
        assert!(calm.notional > wild.notional);

        let lo = rm.size(100_000.0, &sig("a", "X", Direction::Long, 0.0), 0.3);
        let mid = rm.size(100_000.0, &sig("a", "X", Direction::Long, 0.5), 0.3);
        let hi = rm.size(100_000.0, &sig("a", "X", Direction::Long, 1.0), 0.3);
        assert!((lo.fraction - 0.01).abs() < 1e-12);
        assert!((hi.fraction - 0.10).abs() < 1e-12);
        assert!((mid.notional - (lo.notional + hi.notional) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn conflicting_signals_suppressed() {
        let st = PortfolioState::new(100_000.0);
        let ev = rm().evaluate(
            &[sig("a", "X", Direction::Long, 0.9), sig("b", "X", Direction::Short, 0.8)],
            &st,
        );
        assert!(ev.approved.is_empty());
        assert_eq!(ev.rejected[0].reason, RejectReason::DirectionConflict);
        assert_eq!(ev.rejected[0].signal_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn agreeing_signals_make_one_intent() {
        let st = PortfolioState::new(100_000.0);
        let ev = rm().evaluate(
            &[sig("a", "X", Direction::Long, 0.4), sig("b", "X", Direction::Long, 0.8)],
            &st,
        );
        assert_eq!(ev.approved.len(), 1);
        let it = &ev.approved[0];
        assert_eq!(it.signal_ids.len(), 2);
        assert!(it.annotations[0].contains("conf=0.800"));
        match it.action {
            IntentAction::Open { bracket: Bracket::Directional { stop_loss, take_profit } } => {
                assert!((stop_loss - 98.0).abs() < 1e-9);
                assert!((take_profit - 103.0).abs() < 1e-9);
            }
            _ => panic!("expected open intent"),
        }
    }

    #[test]
    fn missing_atr_is_rejected_before_gates() {
        let st = PortfolioState::new(100_000.0);
        let mut s = sig("a", "X", Direction::Long, 0.9);
        s.atr = None;
        let ev = rm().evaluate(&[s], &st);
        assert_eq!(ev.rejected[0].reason, RejectReason::VolatilityUnavailable);
    }

    #[test]
    fn halted_rejects_everything() {
        let mut st = PortfolioState::new(100_000.0);
        st.halted = Some("negative size".into());
        let ev = rm().evaluate(&[sig("a", "X", Direction::Long, 0.9)], &st);
        assert!(matches!(ev.rejected[0].reason, RejectReason::Halted(_)));
    }

    #[test]
    fn batch_approvals_share_the_group_cap() {
        let groups = CorrelationMap::parse("X=tech, Y=tech");
        let limits = RiskLimits { max_correlated_exposure: 0.08, ..RiskLimits::default() };
        let rm = RiskManager::new(limits, groups);
        let st = PortfolioState::new(100_000.0);
        // each ~5000 notional, group cap 8000
        let ev = rm.evaluate(
            &[sig("a", "X", Direction::Long, 1.0), sig("b", "Y", Direction::Long, 1.0)],
            &st,
        );
        assert_eq!(ev.approved.len(), 1);
        assert!(matches!(ev.rejected[0].reason, RejectReason::CorrelationCap { .. }));
    }

    #[test]
    fn tiny_size_fails_minimum() {
        let limits = RiskLimits { lot_size: 1000.0, ..RiskLimits::default() };
        let rm = RiskManager::new(limits, CorrelationMap::default());
        let ev = rm.evaluate(&[sig("a", "X", Direction::Long, 0.9)], &PortfolioState::new(100_000.0));
        assert!(matches!(ev.rejected[0].reason, RejectReason::BelowMinimum { .. }));
    }

    #[test]
    fn base_asset_grouping() {
        let m = CorrelationMap::parse("BTCUSDT=majors");
        assert_eq!(m.group_of("BTCUSDT"), "majors");
        assert_eq!(m.group_of("ETH-USD"), "ETH");
        assert_eq!(m.group_of("ETHUSDT"), "ETH");
        assert_eq!(m.group_of("SOLUSDC"), "SOL");
        assert_eq!(m.group_of("BNBFDUSD"), "BNB");
        assert_eq!(m.group_of("BTC/BUSD"), "BTC");
        assert_eq!(m.group_of("AAPL"), "AAPL");
        assert_eq!(m.group_of("USDT"), "USDT");
    }

    #[test]
    fn same_base_pairs_share_the_group_cap_without_a_map() {
        let limits = RiskLimits { max_correlated_exposure: 0.08, ..RiskLimits::default() };
        let rm = RiskManager::new(limits, CorrelationMap::default());
        let st = PortfolioState::new(100_000.0);
        let ev = rm.evaluate(
            &[
                sig("a", "BTCUSDT", Direction::Long, 1.0),
                sig("b", "BTCUSDC", Direction::Long, 1.0),
                sig("c", "ETHUSDT", Direction::Long, 1.0),
            ],
            &st,
        );
        let approved: Vec<&str> = ev.approved.iter().map(|i| i.symbol.as_str()).collect();
        assert_eq!(approved, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(ev.approved[0].group, "BTC");
        match &ev.rejected[..] {
            [r] => {
                assert_eq!(r.symbol, "BTCUSDC");
                assert!(matches!(&r.reason, RejectReason::CorrelationCap { group, .. } if group == "BTC"));
            }
            other => panic!("unexpected rejections {other:?}"),
        }
    }

    #[test]
    fn drawdown_breach_wins_over_missing_volatility() {
        let mut st = PortfolioState::new(100_000.0);
        st.equity = 85_000.0;
        let mut s = sig("a", "X", Direction::Long, 0.9);
        s.atr = None;
        let ev = rm().evaluate(&[s], &st);
        assert!(matches!(ev.rejected[0].reason, RejectReason::DrawdownBreach { .. }));
    }
}
