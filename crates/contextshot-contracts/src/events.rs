use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    BatchStarted,
    ItemSubmitted,
    JobPolled,
    ItemFinished,
    BatchPaced,
    BatchFinished,
}

impl BatchEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BatchStarted => "batch_started",
            Self::ItemSubmitted => "item_submitted",
            Self::JobPolled => "job_polled",
            Self::ItemFinished => "item_finished",
            Self::BatchPaced => "batch_paced",
            Self::BatchFinished => "batch_finished",
        }
    }
}

/// Append-only writer for a batch's `events.jsonl`.
///
/// - default fields are `type`, `batch_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// Clones share the file lock, so the orchestrator and the poller can write
/// to the same log.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    batch_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                batch_id: batch_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn batch_id(&self) -> &str {
        &self.inner.batch_id
    }

    /// Appends one record and returns it as written.
    pub fn emit(&self, event: BatchEvent, payload: EventPayload) -> anyhow::Result<Value> {
        let record = Value::Object(self.record(event, payload));
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.append(&line).with_context(|| {
            format!(
                "failed to append {} event to {}",
                event.as_str(),
                self.inner.path.display()
            )
        })?;
        Ok(record)
    }

    fn record(&self, event: BatchEvent, payload: EventPayload) -> Map<String, Value> {
        let mut record: Map<String, Value> = [
            ("type", Value::from(event.as_str())),
            ("batch_id", Value::from(self.batch_id())),
            ("ts", Value::from(now_utc_iso())),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
        record.extend(payload);
        record
    }

    /// Writes the full line with a single `write_all`.
    fn append(&self, line: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?
            .write_all(line)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
