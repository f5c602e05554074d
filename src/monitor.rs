// ===============================
// src/monitor.rs
// ===============================
//
// MonitoringExporter:
// - Portfolio actor mem-publish MonitorView lewat watch channel (read-only copy).
// - HTTP (hyper 0.14):
//     GET /metrics   -> Prometheus text
//     GET /portfolio -> equity, drawdown, HWM, realized/unrealized PnL, halted
//     GET /positions -> posisi Open/Closing
//     GET /recent    -> sinyal, intent, risk reject & alert terakhir
//     GET /health    -> 200 "ok", 503 kalau pipeline halted
//
use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::domain::{Alert, Signal, TradeIntent};
use crate::error::RejectReason;
use crate::metrics;
use crate::positions::{PortfolioState, Position};

const RECENT_CAP: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RejectionView {
    pub ts_ns: i64,
    pub symbol: String,
    pub signal_ids: Vec<String>,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioView {
    pub ts_ns: i64,
    pub equity: f64,
    pub total_equity: f64,
    pub high_water_mark: f64,
    pub drawdown: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub open_positions: usize,
    pub pending_intents: usize,
    pub heat: f64,
    pub halted: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorView {
    pub portfolio: PortfolioView,
    pub positions: Vec<Position>,
    pub recent_signals: Vec<Signal>,
    pub recent_intents: Vec<TradeIntent>,
    pub recent_rejections: Vec<RejectionView>,
    pub alerts: Vec<Alert>,
}

/// Owned by the portfolio actor; keeps bounded history and publishes views.
pub struct MonitorPublisher {
    tx: watch::Sender<Arc<MonitorView>>,
    signals: VecDeque<Signal>,
    intents: VecDeque<TradeIntent>,
    rejections: VecDeque<RejectionView>,
    alerts: VecDeque<Alert>,
}

fn push_capped<T>(q: &mut VecDeque<T>, item: T) {
    if q.len() == RECENT_CAP {
        q.pop_front();
    }
    q.push_back(item);
}

impl MonitorPublisher {
    pub fn new() -> (Self, MonitoringExporter) {
        let (tx, rx) = watch::channel(Arc::new(MonitorView::default()));
        let publisher = Self {
            tx,
            signals: VecDeque::new(),
            intents: VecDeque::new(),
            rejections: VecDeque::new(),
            alerts: VecDeque::new(),
        };
        (publisher, MonitoringExporter { rx })
    }

    pub fn signal(&mut self, s: &Signal) {
        push_capped(&mut self.signals, s.clone());
    }

    pub fn intent(&mut self, i: &TradeIntent) {
        push_capped(&mut self.intents, i.clone());
    }

    pub fn rejection(&mut self, r: RejectionView) {
        push_capped(&mut self.rejections, r);
    }

    pub fn alert(&mut self, a: &Alert) {
        push_capped(&mut self.alerts, a.clone());
    }

    pub fn publish(&self, state: &PortfolioState, ts_ns: i64) {
        let portfolio = PortfolioView {
            ts_ns,
            equity: state.equity,
            total_equity: state.total_equity(),
            high_water_mark: state.high_water_mark,
            drawdown: state.drawdown(),
            realized_pnl: state.realized_pnl,
            unrealized_pnl: state.unrealized_pnl(),
            open_positions: state.open_count(),
            pending_intents: state.pending.len(),
            heat: state.heat(),
            halted: state.halted.clone(),
        };
        let view = MonitorView {
            portfolio,
            positions: state.positions.values().cloned().collect(),
            recent_signals: self.signals.iter().cloned().collect(),
            recent_intents: self.intents.iter().cloned().collect(),
            recent_rejections: self.rejections.iter().cloned().collect(),
            alerts: self.alerts.iter().cloned().collect(),
        };
        // no receivers is fine
        let _ = self.tx.send(Arc::new(view));
    }
}

/// Read-only handle for dashboards and tests.
#[derive(Clone)]
pub struct MonitoringExporter {
    rx: watch::Receiver<Arc<MonitorView>>,
}

impl MonitoringExporter {
    pub fn view(&self) -> Arc<MonitorView> {
        self.rx.borrow().clone()
    }

    /// Wait for the next published view.
    pub async fn changed(&mut self) -> Option<Arc<MonitorView>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(_) => text(StatusCode::INTERNAL_SERVER_ERROR, "serialize error"),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp
}

#[derive(Serialize)]
struct Recent<'a> {
    signals: &'a [Signal],
    intents: &'a [TradeIntent],
    rejections: &'a [RejectionView],
    alerts: &'a [Alert],
}

pub fn route<B>(req: &Request<B>, view: &MonitorView) -> Response<Body> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }
    match req.uri().path() {
        "/metrics" => {
            let mut resp = Response::new(Body::from(metrics::encode_metrics()));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        "/portfolio" => json(StatusCode::OK, &view.portfolio),
        "/positions" => json(StatusCode::OK, &view.positions),
        "/recent" => json(
            StatusCode::OK,
            &Recent {
                signals: &view.recent_signals,
                intents: &view.recent_intents,
                rejections: &view.recent_rejections,
                alerts: &view.alerts,
            },
        ),
        "/health" => match &view.portfolio.halted {
            None => text(StatusCode::OK, "ok\n"),
            Some(_) => json(StatusCode::SERVICE_UNAVAILABLE, &view.portfolio),
        },
        _ => text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

/// HTTP server on 0.0.0.0:<port>. Returns only on bind/serve failure.
pub async fn serve(exporter: MonitoringExporter, port: u16) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(move |_conn| {
        let exporter = exporter.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let view = exporter.view();
                async move { Ok::<_, Infallible>(route(&req, &view)) }
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(make);
    info!(%addr, "monitoring server listening (/metrics /portfolio /positions /recent /health)");
    server.await
}
