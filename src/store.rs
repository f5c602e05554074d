// ===============================
// src/store.rs
// ===============================
//
// Durability:
// - PortfolioStore : snapshot PortfolioState (posisi Open/Closing + pending + equity)
// - IntentLog      : JSONL append-only, intent id -> status terakhir
//
// Restart = snapshot terakhir + replay intent yang belum di-ack di log.
//
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::TradeIntent;
use crate::error::StoreError;
use crate::positions::PortfolioState;

pub trait PortfolioStore: Send + 'static {
    fn load(&self) -> Result<Option<PortfolioState>, StoreError>;
    fn save(&self, state: &PortfolioState) -> Result<(), StoreError>;
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// `<dir>/portfolio.json`, replaced atomically (write tmp, then rename).
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { path: dir.as_ref().join("portfolio.json") }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PortfolioStore for JsonFileStore {
    fn load(&self) -> Result<Option<PortfolioState>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(state))
    }

    fn save(&self, state: &PortfolioState) -> Result<(), StoreError> {
        ensure_parent(&self.path)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut w, state)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process store, for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Option<PortfolioState>>,
}

impl PortfolioStore for MemoryStore {
    fn load(&self) -> Result<Option<PortfolioState>, StoreError> {
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(g.clone())
    }

    fn save(&self, state: &PortfolioState) -> Result<(), StoreError> {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *g = Some(state.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    Approved,
    PartiallyFilled,
    Filled,
    Failed,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentStatus::Filled | IntentStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRecord {
    pub intent_id: String,
    pub status: IntentStatus,
    /// Full intent on the Approved record only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<TradeIntent>,
    pub ts_ns: i64,
}

pub struct IntentLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl IntentLog {
    /// Open for append, compacting first: only intents still waiting on the
    /// gateway survive. Returns them in approval order.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<TradeIntent>), StoreError> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path)?;
        let records = Self::read_all(&path)?;
        let live = unacknowledged(&records);

        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            for intent in &live {
                let rec = IntentRecord {
                    intent_id: intent.id.clone(),
                    status: IntentStatus::Approved,
                    intent: Some(intent.clone()),
                    ts_ns: intent.ts_ns,
                };
                serde_json::to_writer(&mut w, &rec)?;
                w.write_all(b"\n")?;
            }
            w.flush()?;
        }
        fs::rename(&tmp, &path)?;
        if records.len() > live.len() {
            info!(path = %path.display(), before = records.len(), after = live.len(), "intent log compacted");
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((Self { path, writer: BufWriter::new(file) }, live))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append and flush; a record is durable once this returns.
    pub fn append(&mut self, rec: &IntentRecord) -> Result<(), StoreError> {
        serde_json::to_writer(&mut self.writer, rec)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn approved(&mut self, intent: &TradeIntent, ts_ns: i64) -> Result<(), StoreError> {
        self.append(&IntentRecord {
            intent_id: intent.id.clone(),
            status: IntentStatus::Approved,
            intent: Some(intent.clone()),
            ts_ns,
        })
    }

    pub fn mark(&mut self, intent_id: &str, status: IntentStatus, ts_ns: i64) -> Result<(), StoreError> {
        self.append(&IntentRecord {
            intent_id: intent_id.to_string(),
            status,
            intent: None,
            ts_ns,
        })
    }

    /// A torn last line (crash mid-write) is skipped with a warning.
    pub fn read_all(path: &Path) -> Result<Vec<IntentRecord>, StoreError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IntentRecord>(&line) {
                Ok(rec) => out.push(rec),
                Err(e) => warn!(line = n + 1, ?e, "intent log: unreadable record skipped"),
            }
        }
        Ok(out)
    }
}

/// Intents whose latest status is not terminal, in approval order.
pub fn unacknowledged(records: &[IntentRecord]) -> Vec<TradeIntent> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: BTreeMap<String, (Option<TradeIntent>, IntentStatus)> = BTreeMap::new();
    for rec in records {
        let entry = latest.entry(rec.intent_id.clone()).or_insert_with(|| {
            order.push(rec.intent_id.clone());
            (None, rec.status)
        });
        if rec.intent.is_some() {
            entry.0 = rec.intent.clone();
        }
        entry.1 = rec.status;
    }
    order
        .into_iter()
        .filter_map(|id| match latest.remove(&id) {
            Some((Some(intent), status)) if !status.is_terminal() => Some(intent),
            _ => None,
        })
        .collect()
}
