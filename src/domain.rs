// ===============================
// src/domain.rs
// ===============================
use chrono::{NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ExecFailure, RejectReason};

pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Client-side id, unik per proses: `<prefix>-<ts_ns>-<rand>`.
pub fn next_id(prefix: &str, ts_ns: i64) -> String {
    format!("{}-{}-{:08x}", prefix, ts_ns, rand::thread_rng().gen::<u32>())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    pub fn conflicts_with(&self, other: Direction) -> bool {
        matches!(
            (self, other),
            (Direction::Long, Direction::Short) | (Direction::Short, Direction::Long)
        )
    }
}

/// One bar/tick for a symbol. Immutable once produced by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub ts_ns: i64,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    /// ATM implied volatility (annualized), when the feed carries one.
    pub implied_vol: Option<f64>,
}

impl MarketSnapshot {
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.close
        }
    }

    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    Call,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegSide {
    Buy,
    Sell,
}

impl LegSide {
    pub fn sign(&self) -> f64 {
        match self {
            LegSide::Buy => 1.0,
            LegSide::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionLeg {
    pub right: OptionRight,
    pub side: LegSide,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub days_to_expiry: u32,
    /// Black-Scholes delta of one long contract of this leg.
    pub delta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructureFamily {
    Vertical,
    IronCondor,
    Calendar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionsStructure {
    BullCallSpread,
    BearPutSpread,
    BullPutSpread,
    BearCallSpread,
    IronCondor,
    CalendarSpread,
}

impl OptionsStructure {
    pub fn family(&self) -> StructureFamily {
        match self {
            OptionsStructure::BullCallSpread
            | OptionsStructure::BearPutSpread
            | OptionsStructure::BullPutSpread
            | OptionsStructure::BearCallSpread => StructureFamily::Vertical,
            OptionsStructure::IronCondor => StructureFamily::IronCondor,
            OptionsStructure::CalendarSpread => StructureFamily::Calendar,
        }
    }

    /// Net premium received at entry.
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            OptionsStructure::BullPutSpread
                | OptionsStructure::BearCallSpread
                | OptionsStructure::IronCondor
        )
    }

    pub fn direction(&self) -> Direction {
        match self {
            OptionsStructure::BullCallSpread | OptionsStructure::BullPutSpread => Direction::Long,
            OptionsStructure::BearPutSpread | OptionsStructure::BearCallSpread => Direction::Short,
            OptionsStructure::IronCondor | OptionsStructure::CalendarSpread => Direction::Neutral,
        }
    }
}

pub const MIN_OPTIONS_DELTA_WEIGHT: f64 = 0.10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instrument {
    Equity,
    Options {
        structure: OptionsStructure,
        legs: Vec<OptionLeg>,
        /// Σ side·delta over legs, per contract.
        net_delta: f64,
        multiplier: f64,
    },
}

impl Instrument {
    pub fn multiplier(&self) -> f64 {
        match self {
            Instrument::Equity => 1.0,
            Instrument::Options { multiplier, .. } => *multiplier,
        }
    }

    /// Notional carried by one unit at underlying price `price`. Options count
    /// delta-adjusted, with a floor so near-flat structures still consume cap.
    pub fn exposure_per_unit(&self, price: f64) -> f64 {
        match self {
            Instrument::Equity => price,
            Instrument::Options {
                net_delta,
                multiplier,
                ..
            } => price * multiplier * net_delta.abs().max(MIN_OPTIONS_DELTA_WEIGHT),
        }
    }

    /// P&L per unit of size for a one-point move of the underlying.
    pub fn pnl_per_point(&self, direction: Direction) -> f64 {
        match self {
            Instrument::Equity => direction.sign(),
            Instrument::Options {
                net_delta,
                multiplier,
                ..
            } => net_delta * multiplier,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
    RiskForced,
}

/// Exit levels on the underlying. A position carries exactly one bracket,
/// i.e. at most one stop-loss condition and at most one take-profit level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Bracket {
    Directional { stop_loss: f64, take_profit: f64 },
    /// Neutral structures: leaving the band is the stop; no take-profit.
    Range { lower: f64, upper: f64 },
}

impl Bracket {
    pub fn triggered(&self, direction: Direction, price: f64) -> Option<CloseReason> {
        match (*self, direction) {
            (Bracket::Directional { stop_loss, take_profit }, Direction::Long) => {
                if price <= stop_loss {
                    Some(CloseReason::StopLoss)
                } else if price >= take_profit {
                    Some(CloseReason::TakeProfit)
                } else {
                    None
                }
            }
            (Bracket::Directional { stop_loss, take_profit }, Direction::Short) => {
                if price >= stop_loss {
                    Some(CloseReason::StopLoss)
                } else if price <= take_profit {
                    Some(CloseReason::TakeProfit)
                } else {
                    None
                }
            }
            (Bracket::Directional { .. }, Direction::Neutral) => None,
            (Bracket::Range { lower, upper }, _) => {
                if price <= lower || price >= upper {
                    Some(CloseReason::StopLoss)
                } else {
                    None
                }
            }
        }
    }

    /// Distance from entry to the stop, used for portfolio heat.
    pub fn stop_distance(&self, entry: f64) -> f64 {
        match *self {
            Bracket::Directional { stop_loss, .. } => (entry - stop_loss).abs(),
            Bracket::Range { lower, upper } => (entry - lower).abs().min((upper - entry).abs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub strategy: String,
    pub symbol: String,
    pub direction: Direction,
    pub instrument: Instrument,
    /// Strength in [0, 1].
    pub confidence: f64,
    pub price: f64,
    pub atr: Option<f64>,
    pub realized_vol: Option<f64>,
    pub supporting: Vec<(String, f64)>,
    pub ts_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { price: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntentAction {
    Open { bracket: Bracket },
    Close { position_id: String, reason: CloseReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: String,
    pub symbol: String,
    pub group: String,
    pub instrument: Instrument,
    pub direction: Direction,
    pub action: IntentAction,
    pub size: f64,
    pub order_type: OrderType,
    /// Underlying price the intent was sized against.
    pub ref_price: f64,
    pub signal_ids: Vec<String>,
    pub annotations: Vec<String>,
    pub ts_ns: i64,
}

impl TradeIntent {
    pub fn is_close(&self) -> bool {
        matches!(self.action, IntentAction::Close { .. })
    }

    pub fn notional(&self) -> f64 {
        self.size * self.instrument.exposure_per_unit(self.ref_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub intent_id: String,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub ts_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectEvent {
    pub intent_id: String,
    pub symbol: String,
    pub reason: ExecFailure,
    pub attempts: u32,
    pub ts_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecReport {
    Filled(FillEvent),
    Rejected(RejectEvent),
}

impl ExecReport {
    pub fn intent_id(&self) -> &str {
        match self {
            ExecReport::Filled(f) => &f.intent_id,
            ExecReport::Rejected(r) => &r.intent_id,
        }
    }
}

/// Operator-facing alert: exhausted execution retries or state corruption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub ts_ns: i64,
    pub symbol: Option<String>,
    pub position_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Md(MarketSnapshot),
    Sig(Signal),
    Intent(TradeIntent),
    RiskReject { symbol: String, signal_ids: Vec<String>, reason: RejectReason },
    Exec(ExecReport),
    Alert(Alert),
    Note(String),
}
