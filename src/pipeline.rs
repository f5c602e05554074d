// ===============================
// src/pipeline.rs
// ===============================
//
// DecisionPipeline (orchestrator).
//
//   feeds --mpsc--> dispatcher --mpsc per symbol--> symbol task
//        symbol task: reorder -> validate -> window -> indicators -> strategies
//        symbol task --PortfolioCmd::Tick (await reply)--> portfolio actor
//   portfolio actor (satu-satunya writer PortfolioState):
//        brackets/flatten -> risk gate -> intent log -> snapshot -> executor
//   executor --ExecReport--> portfolio actor -> fills/rejects, alerts
//
// Per symbol: urutan snapshot dipertahankan (symbol task menunggu reply
// actor sebelum tick berikutnya). Antar symbol: diserialisasi oleh actor,
// jadi risk gate selalu melihat state terbaru termasuk intent yang masih pending.
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::domain::{
    now_ns, Alert, CloseReason, Event, ExecReport, IntentAction, MarketSnapshot, RejectEvent,
    Signal, TradeIntent,
};
use crate::error::{DataGapError, ExecFailure, PipelineError};
use crate::feed::ReorderBuffer;
use crate::gateway::{run_executor, ExecutionGateway};
use crate::indicators::{BarWindow, IndicatorEngine};
use crate::metrics::{
    ALERTS, COMPUTE_ERRORS, DRAWDOWN, EQUITY, HALTED, INTENTS, OPEN_POSITIONS, PNL_REALIZED,
    PNL_UNREALIZED, RISK_REJECTS, SIGNALS, SIGNALS_BY, SNAPSHOTS_DROPPED, SNAPSHOTS_REORDERED,
    TICKS, TICKS_BY_SYMBOL,
};
use crate::monitor::{MonitorPublisher, MonitoringExporter, RejectionView};
use crate::positions::{FillOutcome, PortfolioState, PositionStatus, PositionTracker, RejectOutcome};
use crate::risk::{Rejection, RiskManager};
use crate::store::{IntentLog, IntentStatus, PortfolioStore};
use crate::strategy::StrategyBook;

const CMD_QUEUE: usize = 256;
const EXEC_QUEUE: usize = 1024;
const FEED_QUEUE: usize = 4096;
const RECORD_QUEUE: usize = 8192;

/// What the portfolio actor did with one tick.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub closes: Vec<TradeIntent>,
    pub approved: Vec<TradeIntent>,
    pub rejected: Vec<Rejection>,
}

pub enum PortfolioCmd {
    Tick {
        snapshot: MarketSnapshot,
        signals: Vec<Signal>,
        reply: oneshot::Sender<TickOutcome>,
    },
    Close {
        position_id: String,
        reason: CloseReason,
        reply: oneshot::Sender<Option<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<PortfolioState>,
    },
}

fn record(rec: &Option<mpsc::Sender<Event>>, ev: Event) {
    if let Some(tx) = rec {
        // recorder penuh -> event di-drop, pipeline tidak menunggu
        let _ = tx.try_send(ev);
    }
}

// ---------------------------------------------------------------------------
// dispatcher
// ---------------------------------------------------------------------------

async fn run_dispatcher(
    mut rx: mpsc::Receiver<MarketSnapshot>,
    mut routes: HashMap<String, mpsc::Sender<MarketSnapshot>>,
) {
    while let Some(snap) = rx.recv().await {
        let Some(tx) = routes.get(&snap.symbol) else {
            debug!(symbol = %snap.symbol, "no pipeline for symbol, dropped");
            SNAPSHOTS_DROPPED.with_label_values(&[&snap.symbol, "unknown_symbol"]).inc();
            continue;
        };
        match tx.try_send(snap) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(snap)) => {
                warn!(symbol = %snap.symbol, ts = snap.ts_ns, "symbol queue full, snapshot dropped");
                SNAPSHOTS_DROPPED.with_label_values(&[&snap.symbol, "backpressure"]).inc();
            }
            Err(mpsc::error::TrySendError::Closed(snap)) => {
                warn!(symbol = %snap.symbol, "symbol task gone, route removed");
                routes.remove(&snap.symbol);
            }
        }
    }
    info!("dispatcher stopped");
}

// ---------------------------------------------------------------------------
// per-symbol task
// ---------------------------------------------------------------------------

struct SymbolWorker {
    symbol: String,
    engine: IndicatorEngine,
    window: BarWindow,
    book: Arc<StrategyBook>,
    cmd_tx: mpsc::Sender<PortfolioCmd>,
    rec: Option<mpsc::Sender<Event>>,
}

impl SymbolWorker {
    async fn process(&mut self, snap: MarketSnapshot) -> Result<(), PipelineError> {
        if let Err(e) = self.engine.validate(&snap) {
            warn!(symbol = %self.symbol, err = %e, "malformed snapshot skipped");
            COMPUTE_ERRORS.with_label_values(&[&self.symbol]).inc();
            return Ok(());
        }
        TICKS.inc();
        TICKS_BY_SYMBOL.with_label_values(&[&self.symbol]).inc();
        record(&self.rec, Event::Md(snap.clone()));

        self.window.push(snap.clone());
        let signals = match self.engine.compute(&self.symbol, self.window.as_slice()) {
            Ok(set) => self.book.evaluate(&self.symbol, &set, &snap),
            Err(e) => {
                warn!(symbol = %self.symbol, err = %e, "indicator computation failed");
                COMPUTE_ERRORS.with_label_values(&[&self.symbol]).inc();
                Vec::new()
            }
        };
        for s in &signals {
            SIGNALS.inc();
            SIGNALS_BY.with_label_values(&[&s.strategy, &s.symbol]).inc();
            debug!(id = %s.id, direction = ?s.direction, confidence = s.confidence, "signal");
            record(&self.rec, Event::Sig(s.clone()));
        }

        // brackets harus dicek tiap tick, jadi actor selalu dipanggil
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PortfolioCmd::Tick { snapshot: snap, signals, reply })
            .await
            .map_err(|_| PipelineError::ChannelClosed("portfolio"))?;
        rx.await.map_err(|_| PipelineError::ChannelClosed("portfolio reply"))?;
        Ok(())
    }
}

async fn run_symbol(mut worker: SymbolWorker, mut rx: mpsc::Receiver<MarketSnapshot>, tolerance: Duration) {
    let mut reorder = ReorderBuffer::new(&worker.symbol, tolerance);
    info!(symbol = %worker.symbol, "symbol pipeline started");
    loop {
        let due = reorder.next_due();
        let open = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(snap) => {
                    match reorder.push(snap, Instant::now()) {
                        Ok(true) => {
                            SNAPSHOTS_REORDERED.with_label_values(&[&worker.symbol]).inc();
                        }
                        Ok(false) => {}
                        Err(e) => {
                            let reason = match &e {
                                DataGapError::Stale { .. } => "stale",
                                DataGapError::Duplicate { .. } => "duplicate",
                            };
                            warn!(symbol = %worker.symbol, err = %e, "snapshot rejected");
                            SNAPSHOTS_DROPPED.with_label_values(&[&worker.symbol, reason]).inc();
                        }
                    }
                    true
                }
                None => false,
            },
            _ = sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => true,
        };

        let ready = if open { reorder.release(Instant::now()) } else { reorder.drain() };
        for snap in ready {
            if let Err(e) = worker.process(snap).await {
                error!(symbol = %worker.symbol, err = %e, "symbol pipeline stopped");
                return;
            }
        }
        if !open {
            break;
        }
    }
    info!(symbol = %worker.symbol, "symbol pipeline stopped");
}

// ---------------------------------------------------------------------------
// portfolio actor
// ---------------------------------------------------------------------------

struct PortfolioActor<S: PortfolioStore> {
    tracker: PositionTracker,
    risk: RiskManager,
    store: S,
    log: Option<IntentLog>,
    exec_tx: Option<mpsc::Sender<TradeIntent>>,
    publisher: MonitorPublisher,
    rec: Option<mpsc::Sender<Event>>,
    dirty: bool,
    last_ts: i64,
}

impl<S: PortfolioStore> PortfolioActor<S> {
    fn alert(&mut self, symbol: Option<String>, position_id: Option<String>, message: String) {
        ALERTS.inc();
        let alert = Alert { ts_ns: now_ns(), symbol, position_id, message };
        error!(symbol = ?alert.symbol, position = ?alert.position_id, msg = %alert.message, "OPERATOR ALERT");
        self.publisher.alert(&alert);
        record(&self.rec, Event::Alert(alert));
    }

    /// Operator-facing errors become alerts; the rest stay in the log.
    fn report(&mut self, err: &PipelineError, symbol: Option<String>, position_id: Option<String>, note: &str) {
        if err.is_operator_facing() {
            let message = if note.is_empty() { err.to_string() } else { format!("{err}; {note}") };
            self.alert(symbol, position_id, message);
            return;
        }
        match err {
            PipelineError::RiskRejection(reason) => {
                info!(symbol = ?symbol, code = reason.code(), %reason, "risk rejection")
            }
            other => warn!(symbol = ?symbol, err = %other, "handled locally"),
        }
    }

    fn mark(&mut self, intent_id: &str, status: IntentStatus) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.mark(intent_id, status, now_ns()) {
                error!(intent = %intent_id, err = %e, "intent log write failed");
            }
        }
    }

    fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        match self.store.save(self.tracker.state()) {
            Ok(()) => self.dirty = false,
            Err(e) => error!(err = %PipelineError::from(e), "portfolio snapshot not saved"),
        }
    }

    fn refresh(&mut self) {
        let s = self.tracker.state();
        EQUITY.set(s.total_equity());
        DRAWDOWN.set(s.drawdown());
        PNL_REALIZED.set(s.realized_pnl);
        PNL_UNREALIZED.set(s.unrealized_pnl());
        OPEN_POSITIONS.set(s.open_count() as i64);
        HALTED.set(i64::from(s.halted.is_some()));
        self.publisher.publish(s, self.last_ts);
    }

    /// Log as Approved, then hand to the executor. Already registered with the tracker.
    async fn dispatch(&mut self, intents: &[TradeIntent]) {
        let mut durable = Vec::with_capacity(intents.len());
        for intent in intents {
            let logged = match self.log.as_mut() {
                Some(log) => log.approved(intent, now_ns()),
                None => Ok(()),
            };
            match logged {
                Ok(()) => durable.push(intent.clone()),
                Err(e) => {
                    // tanpa catatan di log, intent tidak bisa dipulihkan setelah restart
                    error!(intent = %intent.id, err = %e, "intent log write failed, intent withdrawn");
                    self.tracker.on_reject(&RejectEvent {
                        intent_id: intent.id.clone(),
                        symbol: intent.symbol.clone(),
                        reason: ExecFailure::GatewayRejected("intent log unavailable".into()),
                        attempts: 0,
                        ts_ns: now_ns(),
                    });
                    self.alert(Some(intent.symbol.clone()), None, format!("intent {} withdrawn: {}", intent.id, e));
                }
            }
        }
        self.dirty = true;
        self.persist();

        for intent in durable {
            INTENTS.with_label_values(&[if intent.is_close() { "close" } else { "open" }]).inc();
            info!(
                intent = %intent.id,
                symbol = %intent.symbol,
                direction = ?intent.direction,
                size = intent.size,
                notional = intent.notional(),
                close = intent.is_close(),
                "intent dispatched"
            );
            self.publisher.intent(&intent);
            record(&self.rec, Event::Intent(intent.clone()));
            let Some(tx) = self.exec_tx.as_ref() else {
                warn!(intent = %intent.id, "executor closed, intent stays pending for next start");
                continue;
            };
            if tx.send(intent).await.is_err() {
                error!("executor channel closed");
                self.exec_tx = None;
            }
        }
    }

    async fn on_tick(&mut self, snapshot: MarketSnapshot, signals: Vec<Signal>) -> TickOutcome {
        self.last_ts = self.last_ts.max(snapshot.ts_ns);
        let closes = self.tracker.on_snapshot(&snapshot);
        if !closes.is_empty() {
            self.dispatch(&closes).await;
        }

        for sig in &signals {
            self.publisher.signal(sig);
        }
        let eval = if signals.is_empty() {
            Default::default()
        } else {
            self.risk.evaluate(&signals, self.tracker.state())
        };
        for rej in &eval.rejected {
            RISK_REJECTS.with_label_values(&[rej.reason.code()]).inc();
            let err = PipelineError::RiskRejection(rej.reason.clone());
            self.report(&err, Some(rej.symbol.clone()), None, "");
            self.publisher.rejection(RejectionView {
                ts_ns: snapshot.ts_ns,
                symbol: rej.symbol.clone(),
                signal_ids: rej.signal_ids.clone(),
                reason: rej.reason.clone(),
            });
            record(
                &self.rec,
                Event::RiskReject {
                    symbol: rej.symbol.clone(),
                    signal_ids: rej.signal_ids.clone(),
                    reason: rej.reason.clone(),
                },
            );
        }
        if !eval.approved.is_empty() {
            self.tracker.register(&eval.approved);
            self.dispatch(&eval.approved).await;
        }
        self.refresh();
        TickOutcome { closes, approved: eval.approved, rejected: eval.rejected }
    }

    fn on_report(&mut self, report: ExecReport) {
        record(&self.rec, Event::Exec(report.clone()));
        // the snapshot is written before the log entry that retires the intent
        let status = match report {
            ExecReport::Filled(fill) => match self.tracker.on_fill(&fill) {
                Ok(FillOutcome::Opened { complete, .. }) => Some((
                    fill.intent_id,
                    if complete { IntentStatus::Filled } else { IntentStatus::PartiallyFilled },
                )),
                Ok(FillOutcome::Closed { .. }) => Some((fill.intent_id, IntentStatus::Filled)),
                Ok(FillOutcome::PartiallyClosed { .. }) => Some((fill.intent_id, IntentStatus::PartiallyFilled)),
                Ok(FillOutcome::Ignored) => None,
                Err(e) => {
                    self.report(&e, Some(fill.symbol.clone()), None, "new intents blocked until resumed");
                    None
                }
            },
            ExecReport::Rejected(rej) => {
                let err = PipelineError::ExecutionFailure {
                    intent_id: rej.intent_id.clone(),
                    attempts: rej.attempts,
                    failure: rej.reason.clone(),
                };
                match self.tracker.on_reject(&rej) {
                    RejectOutcome::CloseReverted { position_id } => {
                        let note = "position back to Open and needs attention";
                        self.report(&err, Some(rej.symbol.clone()), Some(position_id), note);
                    }
                    RejectOutcome::OpenReleased { .. } => self.report(&err, Some(rej.symbol.clone()), None, ""),
                    RejectOutcome::Ignored => {}
                }
                Some((rej.intent_id, IntentStatus::Failed))
            }
        };
        self.dirty = true;
        self.persist();
        if let Some((intent_id, status)) = status {
            self.mark(&intent_id, status);
        }
        self.refresh();
    }

    async fn on_close(&mut self, position_id: &str, reason: CloseReason) -> Option<String> {
        let intent = self.tracker.close_position(position_id, reason, now_ns())?;
        let id = intent.id.clone();
        self.dispatch(std::slice::from_ref(&intent)).await;
        self.refresh();
        Some(id)
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<PortfolioCmd>,
        mut exec_rx: mpsc::Receiver<ExecReport>,
        recovery: Vec<TradeIntent>,
    ) {
        if !recovery.is_empty() {
            info!(n = recovery.len(), "resubmitting recovered intents");
            self.dispatch(&recovery).await;
        }
        self.refresh();

        let shutdown_reply = loop {
            tokio::select! {
                maybe = cmd_rx.recv() => match maybe {
                    Some(PortfolioCmd::Tick { snapshot, signals, reply }) => {
                        let out = self.on_tick(snapshot, signals).await;
                        let _ = reply.send(out);
                    }
                    Some(PortfolioCmd::Close { position_id, reason, reply }) => {
                        let out = self.on_close(&position_id, reason).await;
                        let _ = reply.send(out);
                    }
                    Some(PortfolioCmd::Shutdown { reply }) => break Some(reply),
                    None => break None,
                },
                Some(report) = exec_rx.recv() => self.on_report(report),
            }
        };

        // stop feeding the executor, then collect what is still in flight
        self.exec_tx = None;
        while let Some(report) = exec_rx.recv().await {
            self.on_report(report);
        }
        self.dirty = true;
        self.persist();
        let state = self.tracker.to_persisted();
        let closing = state.positions.values().filter(|p| p.status == PositionStatus::Closing).count();
        info!(
            equity = state.equity,
            positions = state.positions.len(),
            closing,
            pending = state.pending.len(),
            "portfolio actor stopped, state persisted"
        );
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(state);
        }
    }
}

/// Rebuild the tracker from the last snapshot plus the intent log.
/// Returns the intents that must be (re)sent to the executor.
fn recover(
    tracker: &mut PositionTracker,
    log: Option<&mut IntentLog>,
    unacked: Vec<TradeIntent>,
    ts_ns: i64,
) -> Vec<TradeIntent> {
    let mut superseded = Vec::new();
    let mut settled = Vec::new();
    let mut resend = Vec::new();
    for intent in &unacked {
        match &intent.action {
            IntentAction::Open { .. } => {
                if tracker.replay(intent) {
                    info!(intent = %intent.id, "open intent recovered from log");
                } else if !tracker.state().pending.contains_key(&intent.id) {
                    // snapshot already has the fill, only the log entry was lost
                    settled.push(intent.id.clone());
                }
            }
            IntentAction::Close { position_id, reason } => {
                superseded.push(intent.id.clone());
                let still_open = tracker
                    .state()
                    .positions
                    .get(position_id)
                    .is_some_and(|p| p.status == PositionStatus::Open);
                if still_open {
                    if let Some(close) = tracker.start_close(position_id, *reason, ts_ns) {
                        resend.push(close);
                    }
                }
            }
        }
    }
    resend.extend(tracker.recovery_intents(ts_ns));
    resend.extend(tracker.resubmit_intents());

    if let Some(log) = log {
        for id in settled {
            if let Err(e) = log.mark(&id, IntentStatus::Filled, ts_ns) {
                warn!(intent = %id, err = %e, "could not settle filled open intent");
            }
        }
        for id in superseded {
            if let Err(e) = log.mark(&id, IntentStatus::Failed, ts_ns) {
                warn!(intent = %id, err = %e, "could not retire superseded close intent");
            }
        }
    }
    resend
}

/// Handle to a running pipeline.
pub struct Pipeline {
    feed_tx: Option<mpsc::Sender<MarketSnapshot>>,
    cmd_tx: mpsc::Sender<PortfolioCmd>,
    monitor: MonitoringExporter,
    dispatcher: JoinHandle<()>,
    symbol_tasks: Vec<JoinHandle<()>>,
    actor: JoinHandle<()>,
    executor: JoinHandle<()>,
    rec_tx: Option<mpsc::Sender<Event>>,
    recorder: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub async fn start<G, S>(settings: &Settings, gateway: Arc<G>, store: S) -> Result<Pipeline, PipelineError>
    where
        G: ExecutionGateway,
        S: PortfolioStore,
    {
        // ---- State ----
        let mut tracker = match store.load()? {
            Some(state) => {
                info!(equity = state.equity, positions = state.positions.len(), pending = state.pending.len(), "portfolio restored");
                PositionTracker::from_persisted(state, settings.tracker)
            }
            None => PositionTracker::new(settings.initial_equity, settings.tracker),
        };
        if let Some(reason) = &tracker.state().halted {
            error!(%reason, "restored portfolio is halted; new intents stay blocked");
        }

        let (mut log, unacked) = if settings.dry_run {
            (None, Vec::new())
        } else {
            let (log, unacked) = IntentLog::open(settings.intent_log_path())?;
            (Some(log), unacked)
        };
        let recovery = recover(&mut tracker, log.as_mut(), unacked, now_ns());

        // ---- Recorder ----
        let (rec_tx, recorder) = match settings.record_file.clone() {
            Some(path) => {
                let (tx, rx) = mpsc::channel::<Event>(RECORD_QUEUE);
                (Some(tx), Some(tokio::spawn(crate::recorder::run(rx, path))))
            }
            None => (None, None),
        };

        // ---- Executor ----
        let (exec_tx, exec_in_rx) = mpsc::channel::<TradeIntent>(EXEC_QUEUE);
        let (report_tx, report_rx) = mpsc::channel::<ExecReport>(EXEC_QUEUE);
        let executor = tokio::spawn(run_executor(gateway, exec_in_rx, report_tx, settings.exec));

        // ---- Portfolio actor ----
        let (publisher, monitor) = MonitorPublisher::new();
        let (cmd_tx, cmd_rx) = mpsc::channel::<PortfolioCmd>(CMD_QUEUE);
        let actor = PortfolioActor {
            tracker,
            risk: RiskManager::new(settings.risk.clone(), settings.correlation.clone()),
            store,
            log,
            exec_tx: Some(exec_tx),
            publisher,
            rec: rec_tx.clone(),
            dirty: true,
            last_ts: 0,
        };
        let actor = tokio::spawn(actor.run(cmd_rx, report_rx, recovery));

        // ---- Symbol tasks ----
        let book = Arc::new(StrategyBook::new(settings.strategies()));
        let engine = IndicatorEngine::new(settings.indicators.clone());
        let tolerance = Duration::from_millis(settings.reorder_tolerance_ms);
        let mut routes = HashMap::new();
        let mut symbol_tasks = Vec::new();
        for sym in &settings.symbols {
            let (tx, rx) = mpsc::channel::<MarketSnapshot>(settings.symbol_queue);
            routes.insert(sym.clone(), tx);
            let worker = SymbolWorker {
                symbol: sym.clone(),
                engine: engine.clone(),
                window: BarWindow::new(settings.indicators.window_len),
                book: book.clone(),
                cmd_tx: cmd_tx.clone(),
                rec: rec_tx.clone(),
            };
            symbol_tasks.push(tokio::spawn(run_symbol(worker, rx, tolerance)));
        }

        // ---- Dispatcher ----
        let (feed_tx, feed_rx) = mpsc::channel::<MarketSnapshot>(FEED_QUEUE);
        let dispatcher = tokio::spawn(run_dispatcher(feed_rx, routes));

        info!(symbols = ?settings.symbols, strategies = ?book.ids(), "pipeline started");
        Ok(Pipeline {
            feed_tx: Some(feed_tx),
            cmd_tx,
            monitor,
            dispatcher,
            symbol_tasks,
            actor,
            executor,
            rec_tx,
            recorder,
        })
    }

    /// Sender for market data adapters.
    pub fn feed_sender(&self) -> Option<mpsc::Sender<MarketSnapshot>> {
        self.feed_tx.clone()
    }

    pub fn monitor(&self) -> MonitoringExporter {
        self.monitor.clone()
    }

    /// Manual close. Returns the close intent id, or None if the position is
    /// unknown or already closing.
    pub async fn close_position(&self, position_id: &str, reason: CloseReason) -> Result<Option<String>, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PortfolioCmd::Close { position_id: position_id.to_string(), reason, reply })
            .await
            .map_err(|_| PipelineError::ChannelClosed("portfolio"))?;
        rx.await.map_err(|_| PipelineError::ChannelClosed("portfolio reply"))
    }

    /// Stop intake, drain symbol queues and in-flight executions, persist.
    /// Feed adapters holding a sender must be stopped first.
    pub async fn shutdown(mut self) -> Result<PortfolioState, PipelineError> {
        self.feed_tx = None;
        if let Err(e) = self.dispatcher.await {
            error!(?e, "dispatcher task failed");
        }
        for task in self.symbol_tasks {
            if let Err(e) = task.await {
                error!(?e, "symbol task failed");
            }
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PortfolioCmd::Shutdown { reply })
            .await
            .map_err(|_| PipelineError::ChannelClosed("portfolio"))?;
        let state = rx.await.map_err(|_| PipelineError::ChannelClosed("portfolio reply"))?;
        if let Err(e) = self.actor.await {
            error!(?e, "portfolio actor failed");
        }
        if let Err(e) = self.executor.await {
            error!(?e, "executor task failed");
        }

        drop(self.rec_tx);
        if let Some(recorder) = self.recorder {
            let _ = recorder.await;
        }
        info!("pipeline stopped");
        Ok(state)
    }
}
