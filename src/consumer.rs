use crate::record::LogRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Downstream receiver of parsed records and tailer status.
///
/// The tailer calls these synchronously from its task, so implementations must return promptly.
pub trait LogConsumer: Send + Sync {
    fn accept(&self, record: LogRecord) -> Result<()>;
    fn set_current_file(&self, path: &Path);
    fn set_initialized(&self, initialized: bool);
    fn set_working(&self, working: bool);
    fn set_last_entry_timestamp(&self, millis: i64);
    fn set_backlog_count(&self, count: usize);
}

/// Latest status reported by the tailer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TailerStatus {
    pub current_file: Option<PathBuf>,
    pub initialized: bool,
    pub working: bool,
    pub last_entry_millis: Option<i64>,
    pub backlog: usize,
    pub forwarded: u64,
}

/// In-memory status snapshot, for embedders that poll rather than subscribe.
#[derive(Debug, Default)]
pub struct StatusBoard {
    status: Mutex<TailerStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TailerStatus {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, TailerStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LogConsumer for StatusBoard {
    fn accept(&self, _record: LogRecord) -> Result<()> {
        self.lock().forwarded += 1;
        Ok(())
    }

    fn set_current_file(&self, path: &Path) {
        self.lock().current_file = Some(path.to_path_buf());
    }

    fn set_initialized(&self, initialized: bool) {
        self.lock().initialized = initialized;
    }

    fn set_working(&self, working: bool) {
        self.lock().working = working;
    }

    fn set_last_entry_timestamp(&self, millis: i64) {
        self.lock().last_entry_millis = Some(millis);
    }

    fn set_backlog_count(&self, count: usize) {
        self.lock().backlog = count;
    }
}

/// Writes every forwarded record as one JSON object per line.
pub struct JsonLinesConsumer {
    out: Mutex<Box<dyn Write + Send>>,
    status: StatusBoard,
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    time: Option<String>,
    #[serde(flatten)]
    record: &'a LogRecord,
}

impl JsonLinesConsumer {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn to_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open output file {}", path.display()))?;
        Ok(Self::new(Box::new(BufWriter::new(file))))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            status: StatusBoard::new(),
        }
    }

    pub fn status(&self) -> TailerStatus {
        self.status.snapshot()
    }
}

impl LogConsumer for JsonLinesConsumer {
    fn accept(&self, record: LogRecord) -> Result<()> {
        let time = DateTime::from_timestamp_millis(record.timestamp_millis)
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true));
        let line = serde_json::to_string(&JsonRecord {
            time,
            record: &record,
        })
        .context("failed to encode record as JSON")?;

        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(out, "{line}").context("failed to write record")?;
        out.flush().context("failed to flush record output")?;
        drop(out);

        self.status.accept(record)
    }

    fn set_current_file(&self, path: &Path) {
        info!(path = %path.display(), "now tailing");
        self.status.set_current_file(path);
    }

    fn set_initialized(&self, initialized: bool) {
        if initialized && !self.status.snapshot().initialized {
            info!("caught up with live log output");
        }
        self.status.set_initialized(initialized);
    }

    fn set_working(&self, working: bool) {
        debug!(working, "tailer activity changed");
        self.status.set_working(working);
    }

    fn set_last_entry_timestamp(&self, millis: i64) {
        self.status.set_last_entry_timestamp(millis);
    }

    fn set_backlog_count(&self, count: usize) {
        debug!(backlog = count, "backlog updated");
        self.status.set_backlog_count(count);
    }
}
