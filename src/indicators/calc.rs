// ===============================
// src/indicators/calc.rs
// ===============================
//
// Pure indicator math on ordered slices (oldest first). Every function returns
// `None` when the slice is too short for its period; callers map that to
// `IndicatorValue::NotReady`.
//
use crate::domain::MarketSnapshot;

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// EMA seeded with the SMA of the first `period` values. Output index 0 lines up
/// with input index `period - 1`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    out.push(prev);
    for &v in &values[period..] {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// Wilder RSI. Flat input (no gains, no losses) reads as 50.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gain = |c: f64| if c > 0.0 { c } else { 0.0 };
    let loss = |c: f64| if c < 0.0 { -c } else { 0.0 };

    let mut avg_gain = changes[..period].iter().map(|&c| gain(c)).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().map(|&c| loss(c)).sum::<f64>() / period as f64;
    for &c in &changes[period..] {
        avg_gain = (avg_gain * (period - 1) as f64 + gain(c)) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + loss(c)) / period as f64;
    }

    Some(if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    })
}

/// (line, signal, histogram)
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<(f64, f64, f64)> {
    if fast == 0 || fast >= slow {
        return None;
    }
    let fast_s = ema_series(closes, fast);
    let slow_s = ema_series(closes, slow);
    if slow_s.is_empty() {
        return None;
    }
    let offset = slow - fast;
    let line: Vec<f64> = slow_s
        .iter()
        .enumerate()
        .map(|(i, s)| fast_s[i + offset] - s)
        .collect();
    let sig = ema(&line, signal)?;
    let last = *line.last()?;
    Some((last, sig, last - sig))
}

/// Wilder ATR over true ranges; needs `period + 1` bars.
pub fn atr(bars: &[MarketSnapshot], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let tr: Vec<f64> = bars
        .windows(2)
        .map(|w| w[1].true_range(w[0].close))
        .collect();
    let mut value = tr[..period].iter().sum::<f64>() / period as f64;
    for &t in &tr[period..] {
        value = (value * (period - 1) as f64 + t) / period as f64;
    }
    Some(value)
}

/// (upper, middle, lower) with population standard deviation.
pub fn bollinger(closes: &[f64], period: usize, mult: f64) -> Option<(f64, f64, f64)> {
    let middle = sma(closes, period)?;
    let tail = &closes[closes.len() - period..];
    let var = tail.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let sd = var.sqrt();
    Some((middle + mult * sd, middle, middle - mult * sd))
}

/// Classic floor pivot from the previous completed bar: (pivot, r1, s1).
pub fn pivot(bars: &[MarketSnapshot]) -> Option<(f64, f64, f64)> {
    if bars.len() < 2 {
        return None;
    }
    let prev = &bars[bars.len() - 2];
    let p = (prev.high + prev.low + prev.close) / 3.0;
    Some((p, 2.0 * p - prev.low, 2.0 * p - prev.high))
}

/// Annualized stdev of log returns over the last `window` returns.
pub fn realized_vol(closes: &[f64], window: usize, periods_per_year: f64) -> Option<f64> {
    if window < 2 || closes.len() < window + 1 {
        return None;
    }
    let tail = &closes[closes.len() - window - 1..];
    let rets: Vec<f64> = tail.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let mean = rets.iter().sum::<f64>() / rets.len() as f64;
    let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (rets.len() - 1) as f64;
    Some(var.sqrt() * periods_per_year.sqrt())
}

/// Fraction of samples below `current`, ties counted half.
pub fn percentile_rank(samples: &[f64], current: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let below = samples.iter().filter(|&&s| s < current).count() as f64;
    let equal = samples.iter().filter(|&&s| s == current).count() as f64;
    Some((below + 0.5 * equal) / samples.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bar(ts: i64, high: f64, low: f64, close: f64) -> MarketSnapshot {
        MarketSnapshot {
            ts_ns: ts,
            symbol: "TEST".into(),
            open: close,
            high,
            low,
            close,
            volume: 1000.0,
            bid: close,
            ask: close,
            implied_vol: None,
        }
    }

    #[test]
    fn sma_uses_tail_only() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0], 2), None);
    }

    #[test]
    fn ema_seed_and_step() {
        let s = ema_series(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(s.len(), 2);
        assert_relative_eq!(s[0], 2.0);
        // alpha = 0.5
        assert_relative_eq!(s[1], 3.0);
    }

    #[test]
    fn rsi_extremes() {
        let up: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&up, 14), Some(100.0));
        let flat = vec![100.0; 20];
        assert_eq!(rsi(&flat, 14), Some(50.0));
        assert_eq!(rsi(&up[..14], 14), None);
    }

    #[test]
    fn macd_needs_slow_plus_signal_history() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert!(macd(&closes, 12, 26, 9).is_none());
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let (line, signal, hist) = macd(&closes, 12, 26, 9).unwrap();
        assert!(line > 0.0);
        assert_relative_eq!(hist, line - signal);
    }

    #[test]
    fn atr_of_constant_range() {
        let bars: Vec<MarketSnapshot> = (0..20).map(|i| bar(i, 102.0, 98.0, 100.0)).collect();
        assert_relative_eq!(atr(&bars, 14).unwrap(), 4.0);
        assert!(atr(&bars[..14], 14).is_none());
    }

    #[test]
    fn bollinger_flat_collapses() {
        let (u, m, l) = bollinger(&[5.0; 20], 20, 2.0).unwrap();
        assert_eq!((u, m, l), (5.0, 5.0, 5.0));
    }

    #[test]
    fn pivot_from_previous_bar() {
        let bars = vec![bar(0, 110.0, 90.0, 100.0), bar(1, 200.0, 1.0, 150.0)];
        let (p, r1, s1) = pivot(&bars).unwrap();
        assert_relative_eq!(p, 100.0);
        assert_relative_eq!(r1, 110.0);
        assert_relative_eq!(s1, 90.0);
    }

    #[test]
    fn realized_vol_zero_for_constant_growth() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        assert_relative_eq!(realized_vol(&closes, 20, 252.0).unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn percentile_rank_counts_ties_half() {
        assert_eq!(percentile_rank(&[1.0, 2.0, 3.0, 4.0], 3.0), Some(0.625));
        assert_eq!(percentile_rank(&[], 3.0), None);
    }
}
