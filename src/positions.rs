// ===============================
// src/positions.rs (PositionTracker & PortfolioState)
// ===============================
//
// Satu-satunya writer untuk PortfolioState. RiskManager hanya membaca.
//
// Lifecycle per posisi:
//   (fill open intent) -> Open -> Open (partial fill, size bertambah)
//   Open -> Closing (stop / take-profit / manual / risk-forced)
//   Closing -> Closed (fill close intent; P&L direalisasi, posisi dihapus)
//   Closing -> Open (close intent ditolak gateway; cek bracket aktif lagi)
//
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::{
    next_id, Bracket, CloseReason, Direction, FillEvent, Instrument, IntentAction,
    MarketSnapshot, OrderType, RejectEvent, TradeIntent,
};
use crate::error::PipelineError;

const SIZE_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Id of the opening intent.
    pub id: String,
    pub symbol: String,
    pub group: String,
    pub instrument: Instrument,
    pub direction: Direction,
    pub size: f64,
    /// VWAP of opening fills (underlying price).
    pub entry_price: f64,
    /// Exposure counted against the caps, at the intent's reference price.
    pub exposure_notional: f64,
    /// Loss if the stop is hit, for portfolio heat.
    pub risk_amount: f64,
    pub opened_ns: i64,
    pub status: PositionStatus,
    pub last_price: f64,
    pub unrealized_pnl: f64,
    bracket: Bracket,
    pub close_intent: Option<String>,
    pub close_reason: Option<CloseReason>,
    rearm_allowed: bool,
    /// Close retries exhausted; operator must look at this position.
    pub needs_attention: bool,
}

impl Position {
    pub fn bracket(&self) -> Bracket {
        self.bracket
    }

    /// Replace the exit levels. Only honoured once after a Closing -> Open reversal.
    pub fn rearm(&mut self, bracket: Bracket) -> bool {
        if !self.rearm_allowed || self.status != PositionStatus::Open {
            return false;
        }
        self.bracket = bracket;
        self.rearm_allowed = false;
        true
    }

    fn mark(&mut self, price: f64) {
        self.last_price = price;
        self.unrealized_pnl =
            self.instrument.pnl_per_point(self.direction) * (price - self.entry_price) * self.size;
    }
}

/// Approved open intent not yet fully filled. Its notional stays reserved
/// against the caps until it fills or is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOpen {
    pub intent: TradeIntent,
    pub remaining: f64,
    pub reserved_notional: f64,
    pub risk_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    /// Realized equity (cash).
    pub equity: f64,
    pub high_water_mark: f64,
    pub realized_pnl: f64,
    pub positions: BTreeMap<String, Position>,
    pub pending: BTreeMap<String, PendingOpen>,
    /// Set on state corruption; blocks every new intent.
    pub halted: Option<String>,
}

impl PortfolioState {
    pub fn new(equity: f64) -> Self {
        Self {
            equity,
            high_water_mark: equity,
            realized_pnl: 0.0,
            positions: BTreeMap::new(),
            pending: BTreeMap::new(),
            halted: None,
        }
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Realized equity plus open P&L.
    pub fn total_equity(&self) -> f64 {
        self.equity + self.unrealized_pnl()
    }

    pub fn drawdown(&self) -> f64 {
        if self.high_water_mark <= 0.0 {
            return 0.0;
        }
        ((self.high_water_mark - self.total_equity()) / self.high_water_mark).max(0.0)
    }

    pub fn symbol_exposure(&self, symbol: &str) -> f64 {
        let held: f64 = self
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.exposure_notional)
            .sum();
        let reserved: f64 = self
            .pending
            .values()
            .filter(|p| p.intent.symbol == symbol)
            .map(|p| p.reserved_notional)
            .sum();
        held + reserved
    }

    pub fn group_exposure(&self, group: &str) -> f64 {
        let held: f64 = self
            .positions
            .values()
            .filter(|p| p.group == group)
            .map(|p| p.exposure_notional)
            .sum();
        let reserved: f64 = self
            .pending
            .values()
            .filter(|p| p.intent.group == group)
            .map(|p| p.reserved_notional)
            .sum();
        held + reserved
    }

    /// Positions plus pending opens that do not yet have a position.
    pub fn open_count(&self) -> usize {
        let fresh = self
            .pending
            .keys()
            .filter(|id| !self.positions.contains_key(*id))
            .count();
        self.positions.len() + fresh
    }

    /// Directions currently held or pending for a correlation group.
    pub fn group_directions(&self, group: &str) -> Vec<Direction> {
        self.positions
            .values()
            .filter(|p| p.group == group)
            .map(|p| p.direction)
            .chain(self.pending.values().filter(|p| p.intent.group == group).map(|p| p.intent.direction))
            .collect()
    }

    /// Total stop risk over total equity.
    pub fn heat(&self) -> f64 {
        let eq = self.total_equity();
        if eq <= 0.0 {
            return f64::INFINITY;
        }
        let risk: f64 = self.positions.values().map(|p| p.risk_amount).sum::<f64>()
            + self.pending.values().map(|p| p.risk_amount).sum::<f64>();
        risk / eq
    }

    fn update_hwm(&mut self) {
        let total = self.total_equity();
        if total.is_finite() && total > self.high_water_mark {
            self.high_water_mark = total;
        }
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if !self.equity.is_finite() || !self.high_water_mark.is_finite() {
            return Err(format!(
                "non-finite equity {} / hwm {}",
                self.equity, self.high_water_mark
            ));
        }
        for p in self.positions.values() {
            if !(p.size >= 0.0) || !p.size.is_finite() {
                return Err(format!("position {} has invalid size {}", p.id, p.size));
            }
            if !(p.entry_price > 0.0) || !p.entry_price.is_finite() {
                return Err(format!("position {} has invalid entry {}", p.id, p.entry_price));
            }
            if !(p.exposure_notional >= 0.0) {
                return Err(format!("position {} has negative exposure", p.id));
            }
            if p.status == PositionStatus::Closed {
                return Err(format!("closed position {} still in open set", p.id));
            }
        }
        for (id, p) in &self.pending {
            if !(p.remaining >= 0.0) || !(p.reserved_notional >= -SIZE_EPS) {
                return Err(format!("pending intent {} has negative reservation", id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerCfg {
    pub max_drawdown: f64,
    pub flatten_on_drawdown: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Opened { position_id: String, complete: bool },
    PartiallyClosed { position_id: String, pnl: f64 },
    Closed { position_id: String, pnl: f64 },
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectOutcome {
    OpenReleased { intent_id: String },
    CloseReverted { position_id: String },
    Ignored,
}

pub struct PositionTracker {
    state: PortfolioState,
    cfg: TrackerCfg,
    /// Close intents sent and not yet filled or rejected.
    closing: BTreeMap<String, TradeIntent>,
}

impl PositionTracker {
    pub fn new(initial_equity: f64, cfg: TrackerCfg) -> Self {
        Self {
            state: PortfolioState::new(initial_equity),
            cfg,
            closing: BTreeMap::new(),
        }
    }

    /// Rebuild from a persisted snapshot. A snapshot that fails the invariant
    /// checks comes back halted rather than being trusted.
    pub fn from_persisted(mut state: PortfolioState, cfg: TrackerCfg) -> Self {
        if let Err(e) = state.check_invariants() {
            error!(error = %e, "persisted portfolio fails invariants, halting");
            state.halted = Some(e);
        }
        Self { state, cfg, closing: BTreeMap::new() }
    }

    pub fn state(&self) -> &PortfolioState {
        &self.state
    }

    pub fn to_persisted(&self) -> PortfolioState {
        self.state.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.state.halted.is_some()
    }

    pub fn halt(&mut self, reason: String) {
        if self.state.halted.is_none() {
            error!(%reason, "portfolio halted");
            self.state.halted = Some(reason);
        }
    }

    /// Clear a halt after the operator resolved it. Invariants must hold again.
    pub fn resume(&mut self) -> Result<(), PipelineError> {
        self.state.check_invariants().map_err(PipelineError::StateCorruption)?;
        self.state.halted = None;
        Ok(())
    }

    /// Track intents handed to the executor. Opens reserve their notional.
    pub fn register(&mut self, intents: &[TradeIntent]) {
        for intent in intents {
            match &intent.action {
                IntentAction::Open { bracket } => {
                    let risk_amount = bracket.stop_distance(intent.ref_price)
                        * intent.instrument.pnl_per_point(intent.direction).abs()
                        * intent.size;
                    self.state.pending.insert(
                        intent.id.clone(),
                        PendingOpen {
                            intent: intent.clone(),
                            remaining: intent.size,
                            reserved_notional: intent.notional(),
                            risk_amount,
                        },
                    );
                }
                IntentAction::Close { .. } => {
                    self.closing.insert(intent.id.clone(), intent.clone());
                }
            }
        }
    }

    /// Close intent ids currently in flight.
    pub fn closing_intents(&self) -> impl Iterator<Item = &TradeIntent> {
        self.closing.values()
    }

    /// Mark to market, fire brackets, and optionally flatten on drawdown breach.
    /// Returned close intents are already registered.
    pub fn on_snapshot(&mut self, snap: &MarketSnapshot) -> Vec<TradeIntent> {
        let mut triggered = Vec::new();
        for pos in self.state.positions.values_mut() {
            if pos.symbol != snap.symbol {
                continue;
            }
            pos.mark(snap.close);
            if pos.status == PositionStatus::Open {
                if let Some(reason) = pos.bracket.triggered(pos.direction, snap.close) {
                    triggered.push((pos.id.clone(), reason));
                }
            }
        }
        self.state.update_hwm();

        let mut out = Vec::new();
        for (id, reason) in triggered {
            if let Some(intent) = self.start_close(&id, reason, snap.ts_ns) {
                out.push(intent);
            }
        }

        if self.cfg.flatten_on_drawdown
            && self.cfg.max_drawdown > 0.0
            && self.state.drawdown() >= self.cfg.max_drawdown
        {
            let open: Vec<String> = self
                .state
                .positions
                .values()
                .filter(|p| p.status == PositionStatus::Open)
                .map(|p| p.id.clone())
                .collect();
            if !open.is_empty() {
                warn!(drawdown = self.state.drawdown(), n = open.len(), "drawdown breach: flattening");
            }
            for id in open {
                if let Some(intent) = self.start_close(&id, CloseReason::RiskForced, snap.ts_ns) {
                    out.push(intent);
                }
            }
        }
        out
    }

    /// Open -> Closing. Returns the (registered) close intent, or None if the
    /// position is unknown or not Open.
    pub fn start_close(&mut self, position_id: &str, reason: CloseReason, ts_ns: i64) -> Option<TradeIntent> {
        let pos = self.state.positions.get_mut(position_id)?;
        if pos.status != PositionStatus::Open {
            return None;
        }
        let intent = TradeIntent {
            id: next_id("CX", ts_ns),
            symbol: pos.symbol.clone(),
            group: pos.group.clone(),
            instrument: pos.instrument.clone(),
            direction: pos.direction,
            action: IntentAction::Close {
                position_id: pos.id.clone(),
                reason,
            },
            size: pos.size,
            order_type: OrderType::Market,
            ref_price: pos.last_price,
            signal_ids: Vec::new(),
            annotations: vec![format!("close reason={:?} price={:.4}", reason, pos.last_price)],
            ts_ns,
        };
        pos.status = PositionStatus::Closing;
        pos.close_intent = Some(intent.id.clone());
        pos.close_reason = Some(reason);
        pos.rearm_allowed = false;
        info!(position = %pos.id, symbol = %pos.symbol, ?reason, "position closing");
        self.closing.insert(intent.id.clone(), intent.clone());
        Some(intent)
    }

    pub fn close_position(&mut self, position_id: &str, reason: CloseReason, ts_ns: i64) -> Option<TradeIntent> {
        self.start_close(position_id, reason, ts_ns)
    }

    /// Explicit re-arm of a position's exit levels; see [`Position::rearm`].
    pub fn rearm(&mut self, position_id: &str, bracket: Bracket) -> bool {
        let Some(pos) = self.state.positions.get_mut(position_id) else {
            return false;
        };
        let ok = pos.rearm(bracket);
        if ok {
            pos.needs_attention = false;
            info!(position = %position_id, ?bracket, "bracket re-armed");
        }
        ok
    }

    pub fn on_fill(&mut self, fill: &FillEvent) -> Result<FillOutcome, PipelineError> {
        let outcome = if self.state.pending.contains_key(&fill.intent_id) {
            self.apply_open_fill(fill)
        } else if self.closing.contains_key(&fill.intent_id) {
            self.apply_close_fill(fill)
        } else {
            warn!(intent = %fill.intent_id, "fill for unknown intent, ignored");
            FillOutcome::Ignored
        };
        self.state.update_hwm();
        self.verify()?;
        Ok(outcome)
    }

    fn apply_open_fill(&mut self, fill: &FillEvent) -> FillOutcome {
        let Some(pending) = self.state.pending.get_mut(&fill.intent_id) else {
            return FillOutcome::Ignored;
        };
        let qty = fill.size.min(pending.remaining);
        if !(qty > 0.0) {
            warn!(intent = %fill.intent_id, size = fill.size, "empty open fill, ignored");
            return FillOutcome::Ignored;
        }
        let intent = pending.intent.clone();
        let share = qty / pending.remaining;
        let exposure = qty * intent.instrument.exposure_per_unit(intent.ref_price);
        let risk = pending.risk_amount * share;
        pending.remaining -= qty;
        pending.reserved_notional = (pending.reserved_notional - exposure).max(0.0);
        pending.risk_amount -= risk;
        let complete = pending.remaining <= SIZE_EPS;
        if complete {
            self.state.pending.remove(&fill.intent_id);
        }

        let bracket = match intent.action {
            IntentAction::Open { bracket } => bracket,
            // pending only ever holds opens
            IntentAction::Close { .. } => return FillOutcome::Ignored,
        };
        let pos = self
            .state
            .positions
            .entry(intent.id.clone())
            .or_insert_with(|| Position {
                id: intent.id.clone(),
                symbol: intent.symbol.clone(),
                group: intent.group.clone(),
                instrument: intent.instrument.clone(),
                direction: intent.direction,
                size: 0.0,
                entry_price: fill.price,
                exposure_notional: 0.0,
                risk_amount: 0.0,
                opened_ns: fill.ts_ns,
                status: PositionStatus::Open,
                last_price: fill.price,
                unrealized_pnl: 0.0,
                bracket,
                close_intent: None,
                close_reason: None,
                rearm_allowed: false,
                needs_attention: false,
            });
        let new_size = pos.size + qty;
        pos.entry_price = (pos.entry_price * pos.size + fill.price * qty) / new_size;
        pos.size = new_size;
        pos.exposure_notional += exposure;
        pos.risk_amount += risk;
        let last = pos.last_price;
        pos.mark(last);
        info!(position = %pos.id, symbol = %pos.symbol, size = pos.size, entry = pos.entry_price, complete, "open fill");

        FillOutcome::Opened { position_id: intent.id, complete }
    }

    fn apply_close_fill(&mut self, fill: &FillEvent) -> FillOutcome {
        let Some(intent) = self.closing.get(&fill.intent_id) else {
            return FillOutcome::Ignored;
        };
        let IntentAction::Close { position_id, .. } = &intent.action else {
            return FillOutcome::Ignored;
        };
        let position_id = position_id.clone();
        let Some(pos) = self.state.positions.get_mut(&position_id) else {
            warn!(intent = %fill.intent_id, position = %position_id, "close fill for missing position");
            self.closing.remove(&fill.intent_id);
            return FillOutcome::Ignored;
        };

        let qty = fill.size.min(pos.size);
        let pnl = pos.instrument.pnl_per_point(pos.direction) * (fill.price - pos.entry_price) * qty;
        let share = if pos.size > 0.0 { qty / pos.size } else { 1.0 };
        pos.exposure_notional -= pos.exposure_notional * share;
        pos.risk_amount -= pos.risk_amount * share;
        pos.size -= qty;
        self.state.equity += pnl;
        self.state.realized_pnl += pnl;

        if pos.size <= SIZE_EPS {
            pos.status = PositionStatus::Closed;
            info!(position = %position_id, pnl, reason = ?pos.close_reason, "position closed");
            self.state.positions.remove(&position_id);
            self.closing.remove(&fill.intent_id);
            FillOutcome::Closed { position_id, pnl }
        } else {
            let last = pos.last_price;
            pos.mark(last);
            FillOutcome::PartiallyClosed { position_id, pnl }
        }
    }

    /// Final reject after the executor exhausted its retries.
    pub fn on_reject(&mut self, rej: &RejectEvent) -> RejectOutcome {
        if let Some(p) = self.state.pending.remove(&rej.intent_id) {
            info!(intent = %rej.intent_id, remaining = p.remaining, "open intent rejected, reservation released");
            return RejectOutcome::OpenReleased { intent_id: rej.intent_id.clone() };
        }
        let Some(intent) = self.closing.remove(&rej.intent_id) else {
            warn!(intent = %rej.intent_id, "reject for unknown intent, ignored");
            return RejectOutcome::Ignored;
        };
        let IntentAction::Close { position_id, .. } = intent.action else {
            return RejectOutcome::Ignored;
        };
        match self.state.positions.get_mut(&position_id) {
            Some(pos) if pos.status == PositionStatus::Closing => {
                pos.status = PositionStatus::Open;
                pos.close_intent = None;
                pos.rearm_allowed = true;
                pos.needs_attention = true;
                error!(position = %position_id, attempts = rej.attempts, reason = %rej.reason, "close failed, position back to Open");
                RejectOutcome::CloseReverted { position_id }
            }
            _ => RejectOutcome::Ignored,
        }
    }

    /// Positions left in Closing (e.g. after a restart) get fresh close intents.
    pub fn recovery_intents(&mut self, ts_ns: i64) -> Vec<TradeIntent> {
        let stuck: Vec<(String, CloseReason)> = self
            .state
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Closing && p.close_intent.as_ref().map_or(true, |id| !self.closing.contains_key(id)))
            .map(|p| (p.id.clone(), p.close_reason.unwrap_or(CloseReason::RiskForced)))
            .collect();
        let mut out = Vec::new();
        for (id, reason) in stuck {
            if let Some(pos) = self.state.positions.get_mut(&id) {
                pos.status = PositionStatus::Open;
            }
            if let Some(intent) = self.start_close(&id, reason, ts_ns) {
                out.push(intent);
            }
        }
        out
    }

    /// Pending opens to resubmit under their original id, sized to what remains.
    pub fn resubmit_intents(&self) -> Vec<TradeIntent> {
        self.state
            .pending
            .values()
            .map(|p| TradeIntent {
                size: p.remaining,
                ..p.intent.clone()
            })
            .collect()
    }

    /// Re-register an approved intent from the intent log that the snapshot missed.
    pub fn replay(&mut self, intent: &TradeIntent) -> bool {
        let known = self.state.pending.contains_key(&intent.id)
            || self.state.positions.contains_key(&intent.id)
            || self.closing.contains_key(&intent.id);
        if known || intent.is_close() {
            return false;
        }
        self.register(std::slice::from_ref(intent));
        true
    }

    fn verify(&mut self) -> Result<(), PipelineError> {
        if let Err(e) = self.state.check_invariants() {
            self.halt(e.clone());
            return Err(PipelineError::StateCorruption(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecFailure;

    fn open_intent(id: &str, symbol: &str, size: f64, price: f64) -> TradeIntent {
        TradeIntent {
            id: id.into(),
            symbol: symbol.into(),
            group: symbol.into(),
            instrument: Instrument::Equity,
            direction: Direction::Long,
            action: IntentAction::Open {
                bracket: Bracket::Directional { stop_loss: price - 10.0, take_profit: price + 20.0 },
            },
            size,
            order_type: OrderType::Limit { price },
            ref_price: price,
            signal_ids: vec![],
            annotations: vec![],
            ts_ns: 0,
        }
    }

    fn fill(id: &str, price: f64, size: f64) -> FillEvent {
        FillEvent { intent_id: id.into(), symbol: "X".into(), price, size, ts_ns: 1 }
    }

    fn snap(symbol: &str, close: f64, ts: i64) -> MarketSnapshot {
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

    fn tracker() -> PositionTracker {
        PositionTracker::new(10_000.0, TrackerCfg { max_drawdown: 0.1, flatten_on_drawdown: false })
    }

    #[test]
    fn partial_fills_grow_open_position() {
        let mut t = tracker();
        t.register(&[open_intent("IN-1", "X", 10.0, 100.0)]);
        assert_eq!(t.state().symbol_exposure("X"), 1000.0);

        let out = t.on_fill(&fill("IN-1", 100.0, 4.0)).unwrap();
        assert_eq!(out, FillOutcome::Opened { position_id: "IN-1".into(), complete: false });
        // reserved 600 + held 400
        assert!((t.state().symbol_exposure("X") - 1000.0).abs() < 1e-9);

        t.on_fill(&fill("IN-1", 101.0, 6.0)).unwrap();
        let pos = &t.state().positions["IN-1"];
        assert_eq!(pos.status, PositionStatus::Open);
        assert!((pos.size - 10.0).abs() < 1e-12);
        assert!((pos.entry_price - 100.6).abs() < 1e-9);
        assert!(t.state().pending.is_empty());
    }

    #[test]
    fn stop_then_close_fill_realizes_pnl() {
        let mut t = tracker();
        t.register(&[open_intent("IN-1", "X", 10.0, 100.0)]);
        t.on_fill(&fill("IN-1", 100.0, 10.0)).unwrap();

        assert!(t.on_snapshot(&snap("X", 95.0, 2)).is_empty());
        assert!((t.state().unrealized_pnl() + 50.0).abs() < 1e-9);

        let closes = t.on_snapshot(&snap("X", 89.0, 3));
        assert_eq!(closes.len(), 1);
        assert_eq!(t.state().positions["IN-1"].status, PositionStatus::Closing);
        // Closing positions do not fire again
        assert!(t.on_snapshot(&snap("X", 80.0, 4)).is_empty());

        let out = t.on_fill(&fill(&closes[0].id, 89.0, 10.0)).unwrap();
        assert!(matches!(out, FillOutcome::Closed { .. }));
        assert!(t.state().positions.is_empty());
        assert!((t.state().equity - 9_890.0).abs() < 1e-9);
    }

    #[test]
    fn rejected_close_returns_to_open_and_rearms_checks() {
        let mut t = tracker();
        t.register(&[open_intent("IN-1", "X", 1.0, 100.0)]);
        t.on_fill(&fill("IN-1", 100.0, 1.0)).unwrap();
        let closes = t.on_snapshot(&snap("X", 121.0, 2));
        assert_eq!(closes.len(), 1);

        let rej = RejectEvent {
            intent_id: closes[0].id.clone(),
            symbol: "X".into(),
            reason: ExecFailure::Timeout { after_ms: 5000 },
            attempts: 3,
            ts_ns: 3,
        };
        assert_eq!(t.on_reject(&rej), RejectOutcome::CloseReverted { position_id: "IN-1".into() });
        let pos = &t.state().positions["IN-1"];
        assert_eq!(pos.status, PositionStatus::Open);
        assert!(pos.needs_attention);

        // still beyond take-profit: retried on the next snapshot
        assert_eq!(t.on_snapshot(&snap("X", 122.0, 4)).len(), 1);
    }

    #[test]
    fn rearm_only_after_reversal() {
        let mut t = tracker();
        t.register(&[open_intent("IN-1", "X", 1.0, 100.0)]);
        t.on_fill(&fill("IN-1", 100.0, 1.0)).unwrap();
        let new_levels = Bracket::Directional { stop_loss: 80.0, take_profit: 150.0 };
        let pos = t.state.positions.get_mut("IN-1").unwrap();
        assert!(!pos.rearm(new_levels));
        assert_eq!(pos.bracket(), Bracket::Directional { stop_loss: 90.0, take_profit: 120.0 });

        let closes = t.on_snapshot(&snap("X", 85.0, 2));
        t.on_reject(&RejectEvent {
            intent_id: closes[0].id.clone(),
            symbol: "X".into(),
            reason: ExecFailure::GatewayRejected("halted".into()),
            attempts: 3,
            ts_ns: 3,
        });
        let pos = t.state.positions.get_mut("IN-1").unwrap();
        assert!(pos.rearm(new_levels));
        assert!(!pos.rearm(Bracket::Range { lower: 1.0, upper: 2.0 }));
        assert_eq!(pos.bracket(), new_levels);
    }

    #[test]
    fn rejected_open_releases_reservation() {
        let mut t = tracker();
        t.register(&[open_intent("IN-1", "X", 10.0, 100.0)]);
        let out = t.on_reject(&RejectEvent {
            intent_id: "IN-1".into(),
            symbol: "X".into(),
            reason: ExecFailure::GatewayRejected("no liquidity".into()),
            attempts: 3,
            ts_ns: 1,
        });
        assert_eq!(out, RejectOutcome::OpenReleased { intent_id: "IN-1".into() });
        assert_eq!(t.state().symbol_exposure("X"), 0.0);
    }

    #[test]
    fn flatten_on_drawdown_forces_closes() {
        let mut t = PositionTracker::new(
            10_000.0,
            TrackerCfg { max_drawdown: 0.05, flatten_on_drawdown: true },
        );
        let mut intent = open_intent("IN-1", "X", 100.0, 100.0);
        intent.action = IntentAction::Open { bracket: Bracket::Directional { stop_loss: 1.0, take_profit: 1000.0 } };
        t.register(&[intent]);
        t.on_fill(&fill("IN-1", 100.0, 100.0)).unwrap();
        let out = t.on_snapshot(&snap("X", 94.0, 2));
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].action, IntentAction::Close { reason: CloseReason::RiskForced, .. }));
    }

    #[test]
    fn corrupted_state_halts() {
        let mut t = tracker();
        t.register(&[open_intent("IN-1", "X", 1.0, 100.0)]);
        t.on_fill(&fill("IN-1", 100.0, 1.0)).unwrap();
        t.state.positions.get_mut("IN-1").unwrap().size = -1.0;
        let err = t.on_fill(&fill("nope", 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, PipelineError::StateCorruption(_)));
        assert!(t.is_halted());
    }

    #[test]
    fn recovery_reissues_close_for_closing_positions() {
        let mut t = tracker();
        t.register(&[open_intent("IN-1", "X", 1.0, 100.0)]);
        t.on_fill(&fill("IN-1", 100.0, 1.0)).unwrap();
        t.on_snapshot(&snap("X", 80.0, 2));

        let mut restored = PositionTracker::from_persisted(t.to_persisted(), t.cfg);
        let intents = restored.recovery_intents(10);
        assert_eq!(intents.len(), 1);
        assert!(matches!(intents[0].action, IntentAction::Close { reason: CloseReason::StopLoss, .. }));
        assert_eq!(restored.state().positions["IN-1"].status, PositionStatus::Closing);
    }
}
