use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

const ENVELOPE_KEYS: [&str; 4] = ["type", "run_id", "seq", "ts"];

/// Audit events a generation run can leave behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEvent {
    GenerationStarted,
    ProviderAttempt,
    PlaceholderUsed,
    AssetWritten,
    GenerationFinished,
    GenerationFailed,
    UsageRecorded,
}

impl RunEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenerationStarted => "generation_started",
            Self::ProviderAttempt => "provider_attempt",
            Self::PlaceholderUsed => "placeholder_used",
            Self::AssetWritten => "asset_written",
            Self::GenerationFinished => "generation_finished",
            Self::GenerationFailed => "generation_failed",
            Self::UsageRecorded => "usage_recorded",
        }
    }
}

/// Run audit trail, one JSON object per line.
///
/// The envelope (`type`, `run_id`, `seq`, `ts`) is owned by the writer and
/// payload keys with those names are dropped. `seq` counts lines per file
/// across every writer derived with [`EventWriter::for_run`], so interleaved
/// runs can be put back in write order.
#[derive(Debug, Clone)]
pub struct EventWriter {
    log: Arc<AuditLog>,
    run_id: String,
}

#[derive(Debug)]
struct AuditLog {
    path: PathBuf,
    next_seq: Mutex<u64>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            log: Arc::new(AuditLog {
                path: path.into(),
                next_seq: Mutex::new(0),
            }),
            run_id: run_id.into(),
        }
    }

    pub fn for_run(&self, run_id: impl Into<String>) -> Self {
        Self {
            log: Arc::clone(&self.log),
            run_id: run_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, event: RunEvent, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(parent) = self.log.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut next_seq = self
            .log
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?;
        let mut line = Map::new();
        line.insert("type".to_string(), Value::String(event.as_str().to_string()));
        line.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        line.insert("seq".to_string(), Value::from(*next_seq));
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            if !ENVELOPE_KEYS.contains(&key.as_str()) {
                line.insert(key, value);
            }
        }

        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log.path)?;
        file.write_all(&encoded)?;
        *next_seq += 1;

        Ok(Value::Object(line))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
