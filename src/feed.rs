// ===============================
// src/feed.rs
// ===============================
//
// Market Data adapters (MarketDataFeed):
// - run_mock      : random-walk OHLCV bars + ATM implied vol
// - run_binance   : Binance WS kline stream (closed bars only), Sandbox & Mainnet
// Plus ReorderBuffer: late snapshots within tolerance are put back in order,
// anything older than what was already released is rejected as stale.
//
use std::collections::BTreeMap;

use futures_util::StreamExt; // for .next()
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};
use url::Url;

use crate::domain::{now_ns, MarketSnapshot};
use crate::error::DataGapError;

struct Held {
    snap: MarketSnapshot,
    due: Instant,
}

/// Per-symbol event-time reorder buffer.
///
/// A snapshot is released once a newer one is at least `tolerance` ahead of it
/// in event time, or once it has waited `tolerance` of wall time. Release order
/// is always ascending event time.
pub struct ReorderBuffer {
    symbol: String,
    tolerance_ns: i64,
    hold: Duration,
    pending: BTreeMap<i64, Held>,
    watermark: Option<i64>,
    newest: i64,
}

impl ReorderBuffer {
    pub fn new(symbol: &str, tolerance: Duration) -> Self {
        Self {
            symbol: symbol.to_string(),
            tolerance_ns: tolerance.as_nanos().min(i64::MAX as u128) as i64,
            hold: tolerance,
            pending: BTreeMap::new(),
            watermark: None,
            newest: i64::MIN,
        }
    }

    /// Last released event time.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns true if the snapshot arrived behind a newer one (was reordered).
    pub fn push(&mut self, snap: MarketSnapshot, now: Instant) -> Result<bool, DataGapError> {
        if let Some(w) = self.watermark {
            if snap.ts_ns < w {
                return Err(DataGapError::Stale {
                    symbol: self.symbol.clone(),
                    ts_ns: snap.ts_ns,
                    watermark_ns: w,
                });
            }
            if snap.ts_ns == w {
                return Err(DataGapError::Duplicate { symbol: self.symbol.clone(), ts_ns: snap.ts_ns });
            }
        }
        if self.pending.contains_key(&snap.ts_ns) {
            return Err(DataGapError::Duplicate { symbol: self.symbol.clone(), ts_ns: snap.ts_ns });
        }
        let late = snap.ts_ns < self.newest;
        self.newest = self.newest.max(snap.ts_ns);
        self.pending.insert(snap.ts_ns, Held { snap, due: now + self.hold });
        Ok(late)
    }

    /// Pop everything that is due, in event-time order.
    pub fn release(&mut self, now: Instant) -> Vec<MarketSnapshot> {
        let mut out = Vec::new();
        let horizon = self.newest.saturating_sub(self.tolerance_ns);
        while let Some(entry) = self.pending.first_entry() {
            let (ts, due) = (*entry.key(), entry.get().due);
            if ts > horizon && due > now {
                break;
            }
            let held = entry.remove();
            self.watermark = Some(ts);
            out.push(held.snap);
        }
        out
    }

    /// Earliest wall-clock deadline among held snapshots.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|h| h.due).min()
    }

    /// Release everything (shutdown).
    pub fn drain(&mut self) -> Vec<MarketSnapshot> {
        let held = std::mem::take(&mut self.pending);
        let out: Vec<MarketSnapshot> = held.into_values().map(|h| h.snap).collect();
        if let Some(last) = out.last() {
            self.watermark = Some(last.ts_ns);
        }
        out
    }
}

#[derive(Clone, Debug)]
pub struct MockFeedCfg {
    pub start_price: f64,
    /// Wall-clock pause between bars.
    pub emit_ms: u64,
    /// Event-time step between bars.
    pub bar_interval_ns: i64,
    pub bar_vol: f64,
    pub base_iv: f64,
}

impl Default for MockFeedCfg {
    fn default() -> Self {
        Self {
            start_price: 100.0,
            emit_ms: 250,
            bar_interval_ns: 60_000_000_000,
            bar_vol: 0.002,
            base_iv: 0.45,
        }
    }
}

/// Generator market data mock (random walk). Event time advances one bar
/// interval per emitted bar so gap handling sees a regular series.
pub async fn run_mock(tx: mpsc::Sender<MarketSnapshot>, symbol: String, cfg: MockFeedCfg) {
    let mut close = cfg.start_price.max(0.01);
    let mut iv = cfg.base_iv;
    let mut ts = now_ns();
    info!(%symbol, "mock feed started");
    loop {
        // jangan simpan ThreadRng melewati .await
        let snap = {
            let mut rng = rand::thread_rng();
            let open = close;
            let ret: f64 = rng.gen_range(-1.0..=1.0) * cfg.bar_vol * 1.7;
            close = (open * (1.0 + ret)).max(0.01);
            let wick = open.max(close) * rng.gen_range(0.0..cfg.bar_vol);
            let high = open.max(close) + wick;
            let low = (open.min(close) - wick).max(0.005);
            // mean-reverting IV
            iv = (iv + 0.05 * (cfg.base_iv - iv) + rng.gen_range(-0.02..=0.02)).clamp(0.05, 2.0);
            let spread = close * 0.0001;
            ts += cfg.bar_interval_ns;
            MarketSnapshot {
                ts_ns: ts,
                symbol: symbol.clone(),
                open,
                high,
                low,
                close,
                volume: rng.gen_range(1.0..100.0),
                bid: close - spread,
                ask: close + spread,
                implied_vol: Some(iv),
            }
        };
        if tx.send(snap).await.is_err() {
            info!(%symbol, "mock feed: receiver closed, stopped");
            return;
        }
        sleep(Duration::from_millis(cfg.emit_ms)).await;
    }
}

#[derive(Debug, Deserialize)]
struct KlineEnvelope {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: Kline,
}

#[derive(Debug, Deserialize)]
struct Kline {
    #[serde(rename = "t")]
    open_time_ms: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

/// Parse one kline frame; open (unfinished) bars yield None.
pub fn parse_kline(txt: &str) -> Option<MarketSnapshot> {
    let env: KlineEnvelope = serde_json::from_str(txt).ok()?;
    let k = env.kline;
    if !k.closed {
        return None;
    }
    let num = |s: &str| s.parse::<f64>().ok();
    let close = num(&k.close)?;
    Some(MarketSnapshot {
        ts_ns: k.open_time_ms.checked_mul(1_000_000)?,
        symbol: env.symbol,
        open: num(&k.open)?,
        high: num(&k.high)?,
        low: num(&k.low)?,
        close,
        volume: num(&k.volume)?,
        bid: close,
        ask: close,
        implied_vol: None,
    })
}

/// Adapter ke Binance WS (read-only) untuk kline 1m (`<symbol>@kline_1m`)
///
/// - `ws_base` diteruskan dari config:
///     * Sandbox: wss://testnet.binance.vision/ws
///     * Mainnet: wss://stream.binance.com:9443/ws
/// - Hanya bar yang sudah close (`"x": true`) yang diteruskan.
pub async fn run_binance(tx: mpsc::Sender<MarketSnapshot>, symbol: String, ws_base: String) {
    let topic = format!("{}@kline_1m", symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), topic);

    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad ws url");
                return;
            }
        };

        info!(%ws_url, "connecting binance kline");
        match connect_async(url).await {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "connected to kline stream");
                attempt = 0; // reset backoff

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(m) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            if let Some(snap) = parse_kline(&txt) {
                                if tx.send(snap).await.is_err() {
                                    info!(%symbol, "binance feed: receiver closed, stopped");
                                    return;
                                }
                            }
                        }
                        Ok(_) => {
                            // ignore non-text frames
                        }
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }
                info!(%symbol, "kline stream disconnected, will reconnect");
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6); // 0..=6
        let base_ms = 500u64.saturating_mul(1u64 << shift); // 0.5s..32s
        let jitter = rand::thread_rng().gen_range(0..=250);
        sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: i64 = 1_000_000_000;

    fn snap(ts: i64) -> MarketSnapshot {
        MarketSnapshot {
            ts_ns: ts,
            symbol: "X".into(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            bid: 1.0,
            ask: 1.0,
            implied_vol: None,
        }
    }

    fn ts(v: &[MarketSnapshot]) -> Vec<i64> {
        v.iter().map(|s| s.ts_ns / S).collect()
    }

    #[test]
    fn late_snapshot_within_tolerance_is_reordered() {
        let now = Instant::now();
        let mut buf = ReorderBuffer::new("X", Duration::from_secs(2));
        assert!(!buf.push(snap(10 * S), now).unwrap());
        assert!(!buf.push(snap(12 * S), now).unwrap());
        assert!(buf.push(snap(11 * S), now).unwrap());
        // horizon = 12 - 2 = 10
        assert_eq!(ts(&buf.release(now)), vec![10]);
        buf.push(snap(15 * S), now).unwrap();
        assert_eq!(ts(&buf.release(now)), vec![11, 12]);
    }

    #[test]
    fn snapshot_behind_watermark_is_stale() {
        let now = Instant::now();
        let mut buf = ReorderBuffer::new("X", Duration::from_secs(1));
        buf.push(snap(10 * S), now).unwrap();
        buf.push(snap(20 * S), now).unwrap();
        assert_eq!(ts(&buf.release(now)), vec![10]);
        assert!(matches!(buf.push(snap(5 * S), now), Err(DataGapError::Stale { .. })));
        assert!(matches!(buf.push(snap(10 * S), now), Err(DataGapError::Duplicate { .. })));
        assert!(matches!(buf.push(snap(20 * S), now), Err(DataGapError::Duplicate { .. })));
    }

    #[test]
    fn wall_clock_deadline_releases_last_snapshot() {
        let now = Instant::now();
        let mut buf = ReorderBuffer::new("X", Duration::from_millis(500));
        buf.push(snap(10 * S), now).unwrap();
        assert!(buf.release(now).is_empty());
        assert_eq!(buf.next_due(), Some(now + Duration::from_millis(500)));
        assert_eq!(ts(&buf.release(now + Duration::from_millis(500))), vec![10]);
    }

    #[test]
    fn zero_tolerance_passes_through() {
        let now = Instant::now();
        let mut buf = ReorderBuffer::new("X", Duration::ZERO);
        buf.push(snap(1), now).unwrap();
        assert_eq!(buf.release(now).len(), 1);
    }

    #[test]
    fn kline_only_closed_bars() {
        let closed = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":60000,"T":119999,"o":"1.0","h":"2.0","l":"0.5","c":"1.5","v":"10","x":true}}"#;
        let open = closed.replace("\"x\":true", "\"x\":false");
        let s = parse_kline(closed).unwrap();
        assert_eq!(s.ts_ns, 60_000_000_000);
        assert_eq!(s.close, 1.5);
        assert!(parse_kline(&open).is_none());
        assert!(parse_kline("{}").is_none());
    }
}
