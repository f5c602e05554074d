// ===============================
// src/gateway.rs
// ===============================
//
// ExecutionGateway (eksternal) + executor:
// - setiap intent dijalankan di task sendiri (tidak ada yang memblokir pipeline)
// - tiap attempt dibungkus timeout; order macet -> ExecFailure::Timeout
// - gagal -> retry dengan exponential backoff + jitter sampai MAX_EXEC_ATTEMPTS,
//   lalu RejectEvent final dikirim ke PositionTracker
// - partial fill diteruskan, sisanya di-submit ulang dengan id yang sama
//
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ahash::AHashMap;
use rand::Rng;
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{sleep, timeout, Duration},
};
use tracing::{error, info, warn};

use crate::domain::{now_ns, ExecReport, FillEvent, OrderType, RejectEvent, TradeIntent};
use crate::error::ExecFailure;
use crate::metrics::{EXECS, EXEC_LATENCY};

const SIZE_EPS: f64 = 1e-9;

/// Broker/exchange boundary. The intent id is the idempotency key: resubmitting
/// the same id must never double-fill.
pub trait ExecutionGateway: Send + Sync + 'static {
    fn submit(&self, intent: &TradeIntent) -> impl Future<Output = Result<FillEvent, RejectEvent>> + Send;
}

#[derive(Clone, Copy, Debug)]
pub struct ExecCfg {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ExecCfg {
    fn default() -> Self {
        Self { timeout_ms: 5_000, max_attempts: 3, backoff_ms: 250 }
    }
}

/// Filled quantity per intent id, as the venue remembers it.
#[derive(Debug, Clone, Default)]
struct VenueOrder {
    size: f64,
    filled: f64,
    avg_price: f64,
    last_ts: i64,
}

/// Mock venue: fills after a delay at the limit (or reference) price,
/// with configurable reject and partial-fill rates. Orders are keyed by
/// intent id; a resubmit never fills past the size first seen for that id,
/// and a resubmit of a completed order answers with the aggregate fill.
#[derive(Clone, Debug)]
pub struct MockGateway {
    pub fill_ms: u64,
    pub reject_rate: f64,
    pub partial_rate: f64,
    orders: Arc<Mutex<AHashMap<String, VenueOrder>>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(20, 0.0, 0.0)
    }
}

impl MockGateway {
    pub fn new(fill_ms: u64, reject_rate: f64, partial_rate: f64) -> Self {
        Self { fill_ms, reject_rate, partial_rate, orders: Arc::default() }
    }

    pub fn with_fill_ms(mut self, fill_ms: u64) -> Self {
        self.fill_ms = fill_ms;
        self
    }

    /// Total filled so far for an intent id.
    pub fn filled(&self, intent_id: &str) -> f64 {
        match self.orders.lock() {
            Ok(book) => book.get(intent_id).map_or(0.0, |o| o.filled),
            Err(_) => 0.0,
        }
    }
}

impl ExecutionGateway for MockGateway {
    async fn submit(&self, intent: &TradeIntent) -> Result<FillEvent, RejectEvent> {
        // jangan simpan ThreadRng melewati .await
        let (reject, partial) = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(self.reject_rate.clamp(0.0, 1.0)), rng.gen_bool(self.partial_rate.clamp(0.0, 1.0)))
        };
        sleep(Duration::from_millis(self.fill_ms)).await;

        let venue_reject = |why: &str| RejectEvent {
            intent_id: intent.id.clone(),
            symbol: intent.symbol.clone(),
            reason: ExecFailure::GatewayRejected(why.into()),
            attempts: 0,
            ts_ns: now_ns(),
        };
        let Ok(mut book) = self.orders.lock() else {
            return Err(venue_reject("mock venue order book poisoned"));
        };
        let order = book
            .entry(intent.id.clone())
            .or_insert_with(|| VenueOrder { size: intent.size, ..VenueOrder::default() });
        let open_qty = order.size - order.filled;
        if open_qty <= SIZE_EPS && order.filled > SIZE_EPS {
            info!(intent = %intent.id, filled = order.filled, "duplicate submit of a filled order, replaying fill");
            return Ok(FillEvent {
                intent_id: intent.id.clone(),
                symbol: intent.symbol.clone(),
                price: order.avg_price,
                size: order.filled,
                ts_ns: order.last_ts,
            });
        }
        if reject {
            return Err(venue_reject("mock venue reject"));
        }

        let price = match intent.order_type {
            OrderType::Limit { price } => price,
            OrderType::Market => intent.ref_price,
        };
        let want = intent.size.min(open_qty);
        let size = if partial { want / 2.0 } else { want };
        let fill = FillEvent {
            intent_id: intent.id.clone(),
            symbol: intent.symbol.clone(),
            price,
            size,
            ts_ns: now_ns(),
        };
        let total = order.filled + size;
        if total > SIZE_EPS {
            order.avg_price = (order.avg_price * order.filled + price * size) / total;
        }
        order.filled = total;
        order.last_ts = fill.ts_ns;
        Ok(fill)
    }
}

fn backoff(cfg: &ExecCfg, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(6);
    let base = cfg.backoff_ms.saturating_mul(1u64 << shift);
    let jitter = rand::thread_rng().gen_range(0..=cfg.backoff_ms / 2);
    Duration::from_millis(base + jitter)
}

/// Drive one intent to a terminal report. Every partial fill is forwarded.
pub async fn execute<G: ExecutionGateway>(
    gw: Arc<G>,
    intent: TradeIntent,
    tx: mpsc::Sender<ExecReport>,
    cfg: ExecCfg,
) {
    let mut remaining = intent.size;
    let mut attempts: u32 = 0;
    let max_attempts = cfg.max_attempts.max(1);

    loop {
        attempts += 1;
        let req = TradeIntent { size: remaining, ..intent.clone() };
        let t0 = Instant::now();
        let failure = match timeout(Duration::from_millis(cfg.timeout_ms), gw.submit(&req)).await {
            Ok(Ok(fill)) if fill.size > SIZE_EPS => {
                EXEC_LATENCY.observe(t0.elapsed().as_secs_f64() * 1_000.0);
                let filled = fill.size.min(remaining);
                remaining -= filled;
                let done = remaining <= SIZE_EPS;
                EXECS.with_label_values(&[if done { "filled" } else { "partial" }]).inc();
                if tx.send(ExecReport::Filled(FillEvent { size: filled, ..fill })).await.is_err() {
                    warn!(intent = %intent.id, "exec report channel closed");
                    return;
                }
                if done {
                    return;
                }
                // progress made: fresh attempt budget for the remainder
                attempts = 0;
                continue;
            }
            Ok(Ok(_)) => ExecFailure::GatewayRejected("empty fill".into()),
            Ok(Err(rej)) => rej.reason,
            Err(_) => {
                EXECS.with_label_values(&["timeout"]).inc();
                ExecFailure::Timeout { after_ms: cfg.timeout_ms }
            }
        };

        if attempts >= max_attempts {
            EXECS.with_label_values(&["rejected"]).inc();
            error!(intent = %intent.id, symbol = %intent.symbol, attempts, reason = %failure, "execution failed, retries exhausted");
            let rej = RejectEvent {
                intent_id: intent.id.clone(),
                symbol: intent.symbol.clone(),
                reason: failure,
                attempts,
                ts_ns: now_ns(),
            };
            let _ = tx.send(ExecReport::Rejected(rej)).await;
            return;
        }

        let wait = backoff(&cfg, attempts);
        EXECS.with_label_values(&["retry"]).inc();
        warn!(intent = %intent.id, attempts, reason = %failure, wait_ms = wait.as_millis() as u64, "execution attempt failed, retrying");
        sleep(wait).await;
    }
}

/// Executor task. Returns after the intent channel closes and every
/// in-flight intent reached a terminal report.
pub async fn run_executor<G: ExecutionGateway>(
    gw: Arc<G>,
    mut rx: mpsc::Receiver<TradeIntent>,
    tx: mpsc::Sender<ExecReport>,
    cfg: ExecCfg,
) {
    let mut inflight = JoinSet::new();
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(intent) => {
                    inflight.spawn(execute(gw.clone(), intent, tx.clone(), cfg));
                }
                None => break,
            },
            Some(res) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = res {
                    error!(?e, "execution task failed");
                }
            }
        }
    }
    let n = inflight.len();
    while let Some(res) = inflight.join_next().await {
        if let Err(e) = res {
            error!(?e, "execution task failed");
        }
    }
    info!(drained = n, "executor stopped");
}
