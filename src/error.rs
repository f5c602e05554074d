// ===============================
// src/error.rs
// ===============================
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Missing or stale market data. Local to one symbol.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataGapError {
    #[error("stale snapshot for {symbol}: ts {ts_ns} <= watermark {watermark_ns}")]
    Stale {
        symbol: String,
        ts_ns: i64,
        watermark_ns: i64,
    },
    #[error("duplicate snapshot for {symbol} at ts {ts_ns}")]
    Duplicate { symbol: String, ts_ns: i64 },
}

/// Indicator math on malformed input. Isolated to the affected symbol.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputationError {
    #[error("non-finite {field} for {symbol} at ts {ts_ns}")]
    NonFinite {
        symbol: String,
        field: &'static str,
        ts_ns: i64,
    },
    #[error("non-positive price {price} for {symbol} at ts {ts_ns}")]
    NonPositivePrice { symbol: String, price: f64, ts_ns: i64 },
    #[error("high {high} below low {low} for {symbol} at ts {ts_ns}")]
    InvertedRange {
        symbol: String,
        high: f64,
        low: f64,
        ts_ns: i64,
    },
    #[error("window for {symbol} is not strictly time ordered at ts {ts_ns}")]
    Unordered { symbol: String, ts_ns: i64 },
    #[error("window contains {found} while computing {expected}")]
    SymbolMismatch { expected: String, found: String },
}

/// Risk gate that refused a signal group. Logged, never escalated.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("pipeline halted: {0}")]
    Halted(String),
    #[error("strategies disagree on direction")]
    DirectionConflict,
    #[error("no volatility estimate (ATR / realized vol not ready)")]
    VolatilityUnavailable,
    #[error("drawdown {drawdown:.4} breaches limit {limit:.4}")]
    DrawdownBreach { drawdown: f64, limit: f64 },
    #[error("symbol exposure {exposure:.2} would exceed cap {cap:.2}")]
    SymbolExposureCap { exposure: f64, cap: f64 },
    #[error("correlated exposure in group {group} {exposure:.2} would exceed cap {cap:.2}")]
    CorrelationCap {
        group: String,
        exposure: f64,
        cap: f64,
    },
    #[error("notional {notional:.2} below minimum {minimum:.2}")]
    BelowMinimum { notional: f64, minimum: f64 },
    #[error("{open} open positions, max {max}")]
    MaxOpenPositions { open: usize, max: usize },
    #[error("portfolio heat {heat:.4} would exceed {max:.4}")]
    PortfolioHeat { heat: f64, max: f64 },
}

impl RejectReason {
    /// Stable label for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Halted(_) => "halted",
            RejectReason::DirectionConflict => "direction_conflict",
            RejectReason::VolatilityUnavailable => "volatility_unavailable",
            RejectReason::DrawdownBreach { .. } => "drawdown_breach",
            RejectReason::SymbolExposureCap { .. } => "symbol_exposure_cap",
            RejectReason::CorrelationCap { .. } => "correlation_cap",
            RejectReason::BelowMinimum { .. } => "below_minimum",
            RejectReason::MaxOpenPositions { .. } => "max_open_positions",
            RejectReason::PortfolioHeat { .. } => "portfolio_heat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ExecFailure {
    #[error("gateway rejected: {0}")]
    GatewayRejected(String),
    #[error("no response within {after_ms} ms")]
    Timeout { after_ms: u64 },
}

impl ExecFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ExecFailure::GatewayRejected(_) => "rejected",
            ExecFailure::Timeout { .. } => "timeout",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    DataGap(#[from] DataGapError),

    #[error(transparent)]
    Computation(#[from] ComputationError),

    #[error("risk rejection: {0}")]
    RiskRejection(RejectReason),

    #[error("execution failure for intent {intent_id} after {attempts} attempt(s): {failure}")]
    ExecutionFailure {
        intent_id: String,
        attempts: u32,
        failure: ExecFailure,
    },

    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error("invalid config {key}: {reason}")]
    Config { key: String, reason: String },

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}

impl PipelineError {
    /// Only these two reach the operator; the rest are handled locally.
    pub fn is_operator_facing(&self) -> bool {
        matches!(
            self,
            PipelineError::StateCorruption(_) | PipelineError::ExecutionFailure { .. }
        )
    }
}
