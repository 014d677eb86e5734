//! Per-session JSONL transcript of chat turns.
//!
//! Each line is one [`TranscriptRecord`]: the event's own fields tagged by
//! `type`, plus the session id and a UTC timestamp.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    TurnStarted {
        request_id: String,
        message: String,
        models: Vec<String>,
        analyzer: String,
    },
    /// One stream event as the router saw it, with what it did about it.
    #[serde(rename = "stream_event")]
    Routed {
        request_id: String,
        event: String,
        outcome: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    TurnFinished {
        request_id: String,
        applied: usize,
        discarded: usize,
        malformed: usize,
        failed: bool,
        aborted: bool,
        grouped_locally: bool,
    },
}

impl TranscriptEvent {
    pub fn request_id(&self) -> &str {
        match self {
            TranscriptEvent::TurnStarted { request_id, .. }
            | TranscriptEvent::Routed { request_id, .. }
            | TranscriptEvent::TurnFinished { request_id, .. } => request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(flatten)]
    pub event: TranscriptEvent,
    pub session_id: String,
    pub ts: String,
}

/// Appends records to one file. Clones share the open handle, so lines from
/// the router and the session never interleave.
#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    path: PathBuf,
    session_id: String,
    file: Arc<Mutex<Option<File>>>,
}

impl TranscriptWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record(&self, event: TranscriptEvent) -> anyhow::Result<TranscriptRecord> {
        let record = TranscriptRecord {
            event,
            session_id: self.session_id.clone(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(line.as_bytes())
                .with_context(|| format!("failed to append to {}", self.path.display()))?;
        }
        Ok(record)
    }

    fn open(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open transcript {}", self.path.display()))
    }
}
