// ===============================
// tests/scenarios.rs
// ===============================
//
// End-to-end decision scenarios over the public API:
// risk gates against a live PositionTracker, options selection,
// persistence, and property tests for exposure caps and the high-water mark.
//
use proptest::prelude::*;

use tradeflow_bot::domain::{
    Bracket, CloseReason, Direction, FillEvent, Instrument, IntentAction, LegSide, MarketSnapshot,
    OptionsStructure, OrderType, RejectEvent, Signal, TradeIntent,
};
use tradeflow_bot::error::{ExecFailure, RejectReason};
use tradeflow_bot::indicators::{IndicatorName, IndicatorSet, IndicatorValue};
use tradeflow_bot::positions::{PositionStatus, PositionTracker, RejectOutcome, TrackerCfg};
use tradeflow_bot::risk::{CorrelationMap, RiskLimits, RiskManager};
use tradeflow_bot::store::{JsonFileStore, PortfolioStore};
use tradeflow_bot::strategy::{OptionsCfg, Strategy as SignalStrategy};

fn signal(id: &str, symbol: &str, direction: Direction, price: f64) -> Signal {
    Signal {
        id: id.into(),
        strategy: "technical".into(),
        symbol: symbol.into(),
        direction,
        instrument: Instrument::Equity,
        confidence: 0.5,
        price,
        atr: Some(price * 0.01),
        realized_vol: Some(0.3),
        supporting: vec![],
        ts_ns: 1,
    }
}

fn open(id: &str, symbol: &str, size: f64, price: f64) -> TradeIntent {
    TradeIntent {
        id: id.into(),
        symbol: symbol.into(),
        group: symbol.into(),
        instrument: Instrument::Equity,
        direction: Direction::Long,
        action: IntentAction::Open {
            bracket: Bracket::Directional { stop_loss: price * 0.9, take_profit: price * 2.0 },
        },
        size,
        order_type: OrderType::Limit { price },
        ref_price: price,
        signal_ids: vec![],
        annotations: vec![],
        ts_ns: 1,
    }
}

fn fill(intent_id: &str, symbol: &str, price: f64, size: f64) -> FillEvent {
    FillEvent { intent_id: intent_id.into(), symbol: symbol.into(), price, size, ts_ns: 2 }
}

fn bar(symbol: &str, ts: i64, close: f64) -> MarketSnapshot {
    MarketSnapshot {
        ts_ns: ts,
        symbol: symbol.into(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
        bid: close,
        ask: close,
        implied_vol: None,
    }
}

fn tracker(equity: f64) -> PositionTracker {
    PositionTracker::new(equity, TrackerCfg { max_drawdown: 0.10, flatten_on_drawdown: false })
}

#[test]
fn drawdown_breach_blocks_new_intents() {
    let mut t = tracker(100_000.0);
    t.register(&[open("IN-1", "X", 100.0, 1_000.0)]);
    t.on_fill(&fill("IN-1", "X", 1_000.0, 100.0)).unwrap();
    let close = t.start_close("IN-1", CloseReason::Manual, 3).unwrap();
    t.on_fill(&fill(&close.id, "X", 890.0, 100.0)).unwrap();

    let st = t.state();
    assert!((st.equity - 89_000.0).abs() < 1e-6);
    assert!((st.drawdown() - 0.11).abs() < 1e-9);

    let risk = RiskManager::new(RiskLimits::default(), CorrelationMap::default());
    let ev = risk.evaluate(&[signal("s1", "X", Direction::Long, 900.0)], st);
    assert!(ev.approved.is_empty());
    assert!(matches!(ev.rejected[0].reason, RejectReason::DrawdownBreach { .. }));
}

#[test]
fn symbol_at_cap_rejected_other_symbol_approved() {
    let mut t = tracker(10_000.0);
    t.register(&[open("IN-X", "X", 5.0, 100.0)]);
    t.on_fill(&fill("IN-X", "X", 100.0, 5.0)).unwrap();

    let limits = RiskLimits { max_symbol_notional: 500.0, ..RiskLimits::default() };
    let risk = RiskManager::new(limits, CorrelationMap::default());
    let ev = risk.evaluate(
        &[signal("sx", "X", Direction::Long, 100.0), signal("sy", "Y", Direction::Long, 100.0)],
        t.state(),
    );

    assert_eq!(ev.rejected.len(), 1);
    assert_eq!(ev.rejected[0].symbol, "X");
    assert!(matches!(ev.rejected[0].reason, RejectReason::SymbolExposureCap { .. }));
    assert_eq!(ev.approved.len(), 1);
    assert_eq!(ev.approved[0].symbol, "Y");
    assert!(ev.approved[0].notional() <= 500.0);
}

#[test]
fn conflicting_same_tick_signals_make_no_intent() {
    let t = tracker(100_000.0);
    let risk = RiskManager::new(RiskLimits::default(), CorrelationMap::default());
    let ev = risk.evaluate(
        &[signal("a", "X", Direction::Long, 100.0), signal("b", "X", Direction::Short, 100.0)],
        t.state(),
    );
    assert!(ev.approved.is_empty());
    assert_eq!(ev.rejected[0].reason, RejectReason::DirectionConflict);
}

fn bullish_set(iv_pct: f64) -> IndicatorSet {
    let mut set = IndicatorSet::empty("BTCUSDT", 0);
    set.insert(IndicatorName::EmaShort, IndicatorValue::Simple(101.0));
    set.insert(IndicatorName::EmaLong, IndicatorValue::Simple(100.0));
    set.insert(IndicatorName::Macd, IndicatorValue::Macd { line: 0.4, signal: 0.1, histogram: 0.3 });
    set.insert(IndicatorName::Rsi, IndicatorValue::Simple(58.0));
    set.insert(IndicatorName::Pivot, IndicatorValue::Pivot { pivot: 99.0, r1: 101.0, s1: 97.0 });
    set.insert(IndicatorName::Atr, IndicatorValue::Simple(1.2));
    set.insert(IndicatorName::RealizedVol, IndicatorValue::Simple(0.4));
    set.insert(IndicatorName::IvPercentile, IndicatorValue::Simple(iv_pct));
    set
}

#[test]
fn high_iv_bullish_never_buys_naked_options() {
    let strat = SignalStrategy::Options(OptionsCfg::default());
    let mut snap = bar("BTCUSDT", 1_700_000_000_000_000_000, 100.0);
    snap.implied_vol = Some(0.8);

    let sig = strat.generate("BTCUSDT", &bullish_set(0.95), &snap).unwrap();
    let Instrument::Options { structure, legs, .. } = &sig.instrument else {
        panic!("options strategy produced {:?}", sig.instrument);
    };
    assert!(
        structure.is_credit() || *structure == OptionsStructure::IronCondor,
        "selected {structure:?}"
    );
    assert!(legs.len() >= 2);
    assert!(legs.iter().any(|l| l.side == LegSide::Sell));
}

#[test]
fn portfolio_round_trips_through_store() {
    let mut t = tracker(50_000.0);
    t.register(&[open("IN-1", "X", 3.0, 100.0), open("IN-2", "Y", 2.0, 250.0)]);
    t.on_fill(&fill("IN-1", "X", 101.0, 3.0)).unwrap();
    t.on_fill(&fill("IN-2", "Y", 249.0, 1.0)).unwrap(); // partial: IN-2 still pending
    t.on_snapshot(&bar("X", 10, 104.0));
    t.start_close("IN-1", CloseReason::Manual, 11).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());
    store.save(t.state()).unwrap();
    let loaded = store.load().unwrap().unwrap();

    assert_eq!(loaded.equity, t.state().equity);
    assert_eq!(loaded.positions, t.state().positions);
    assert_eq!(loaded.pending.len(), 1);
    assert_eq!(loaded.positions["IN-1"].status, PositionStatus::Closing);

    // a restart re-issues the close for the position left in Closing
    let mut restored = PositionTracker::from_persisted(loaded, TrackerCfg::default());
    let resend = restored.recovery_intents(20);
    assert_eq!(resend.len(), 1);
    assert!(matches!(&resend[0].action, IntentAction::Close { position_id, .. } if position_id == "IN-1"));
    assert_eq!(restored.resubmit_intents()[0].size, 1.0);
}

#[test]
fn brackets_change_only_through_rearm_after_reversal() {
    let mut t = tracker(100_000.0);
    t.register(&[open("IN-1", "X", 1.0, 100.0)]);
    t.on_fill(&fill("IN-1", "X", 100.0, 1.0)).unwrap();
    let original = t.state().positions["IN-1"].bracket();
    assert!(!t.rearm("IN-1", Bracket::Directional { stop_loss: 1.0, take_profit: 1_000.0 }));

    for (i, px) in [101.0, 105.0, 97.0, 120.0].into_iter().enumerate() {
        t.on_snapshot(&bar("X", 10 + i as i64, px));
        assert_eq!(t.state().positions["IN-1"].bracket(), original);
    }

    let close = t.start_close("IN-1", CloseReason::Manual, 20).unwrap();
    let outcome = t.on_reject(&RejectEvent {
        intent_id: close.id,
        symbol: "X".into(),
        reason: ExecFailure::Timeout { after_ms: 5_000 },
        attempts: 3,
        ts_ns: 21,
    });
    assert!(matches!(outcome, RejectOutcome::CloseReverted { .. }));
    let pos = &t.state().positions["IN-1"];
    assert_eq!(pos.status, PositionStatus::Open);
    assert!(pos.needs_attention);
    assert_eq!(pos.bracket(), original);

    let tighter = Bracket::Directional { stop_loss: 95.0, take_profit: 150.0 };
    assert!(t.rearm("IN-1", tighter));
    assert_eq!(t.state().positions["IN-1"].bracket(), tighter);
    // one re-arm per reversal
    assert!(!t.rearm("IN-1", original));
}

#[derive(Debug, Clone)]
enum Op {
    Signal { sym: usize, price: f64, confidence: f64 },
    Fill { nth: usize, fraction: f64 },
    Reject { nth: usize },
    Mark { sym: usize, price: f64 },
    Close { nth: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3, 50.0f64..150.0, 0.0f64..1.0)
            .prop_map(|(sym, price, confidence)| Op::Signal { sym, price, confidence }),
        (0usize..8, 0.1f64..1.0).prop_map(|(nth, fraction)| Op::Fill { nth, fraction }),
        (0usize..8).prop_map(|nth| Op::Reject { nth }),
        (0usize..3, 50.0f64..150.0).prop_map(|(sym, price)| Op::Mark { sym, price }),
        (0usize..8).prop_map(|nth| Op::Close { nth }),
    ]
}

const SYMS: [&str; 3] = ["AAA", "BBB", "CCC"];

proptest! {
    #[test]
    fn symbol_exposure_never_exceeds_cap(ops in proptest::collection::vec(op(), 1..60)) {
        let cap = 3_000.0;
        let limits = RiskLimits { max_symbol_notional: cap, max_open_positions: 50, max_portfolio_heat: 10.0, ..RiskLimits::default() };
        let risk = RiskManager::new(limits, CorrelationMap::default());
        let mut t = tracker(100_000.0);
        let mut ts = 100i64;

        for op in ops {
            ts += 1;
            match op {
                Op::Signal { sym, price, confidence } => {
                    let mut s = signal(&format!("s{ts}"), SYMS[sym], Direction::Long, price);
                    s.confidence = confidence;
                    s.ts_ns = ts;
                    let ev = risk.evaluate(&[s], t.state());
                    t.register(&ev.approved);
                }
                Op::Fill { nth, fraction } => {
                    let pick = t.state().pending.values().nth(nth).map(|p| (p.intent.clone(), p.remaining));
                    if let Some((intent, remaining)) = pick {
                        t.on_fill(&fill(&intent.id, &intent.symbol, intent.ref_price, remaining * fraction)).unwrap();
                    }
                }
                Op::Reject { nth } => {
                    let pick = t.state().pending.values().nth(nth).map(|p| p.intent.clone());
                    if let Some(intent) = pick {
                        t.on_reject(&RejectEvent {
                            intent_id: intent.id,
                            symbol: intent.symbol,
                            reason: ExecFailure::GatewayRejected("x".into()),
                            attempts: 3,
                            ts_ns: ts,
                        });
                    }
                }
                Op::Mark { sym, price } => {
                    let closes = t.on_snapshot(&bar(SYMS[sym], ts, price));
                    for c in closes {
                        t.on_fill(&fill(&c.id, &c.symbol, price, c.size)).unwrap();
                    }
                }
                Op::Close { nth } => {
                    let id = t.state().positions.keys().nth(nth).cloned();
                    if let Some(c) = id.and_then(|id| t.start_close(&id, CloseReason::Manual, ts)) {
                        t.on_fill(&fill(&c.id, &c.symbol, c.ref_price, c.size)).unwrap();
                    }
                }
            }
            for sym in SYMS {
                prop_assert!(t.state().symbol_exposure(sym) <= cap + 1e-6,
                    "{} exposure {} over cap", sym, t.state().symbol_exposure(sym));
            }
        }
    }

    #[test]
    fn high_water_mark_is_monotonic(walk in proptest::collection::vec(-0.05f64..0.05, 1..200)) {
        let mut t = tracker(100_000.0);
        t.register(&[open("IN-1", "X", 100.0, 100.0)]);
        t.on_fill(&fill("IN-1", "X", 100.0, 100.0)).unwrap();

        let mut price = 100.0;
        let mut last_hwm = t.state().high_water_mark;
        for (i, r) in walk.into_iter().enumerate() {
            price = (price * (1.0 + r)).max(1.0);
            let closes = t.on_snapshot(&bar("X", 10 + i as i64, price));
            for c in closes {
                t.on_fill(&fill(&c.id, &c.symbol, price, c.size)).unwrap();
            }
            let st = t.state();
            prop_assert!(st.high_water_mark >= last_hwm);
            prop_assert!(st.high_water_mark + 1e-9 >= st.total_equity());
            prop_assert!(st.drawdown() >= 0.0);
            last_hwm = st.high_water_mark;
        }
    }
}
