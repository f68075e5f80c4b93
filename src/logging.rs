//! Diagnostics output and the JSONL lifecycle event log.
//!
//! Tracing always goes to **stderr**: in agent mode stdout carries the IPC
//! channel and must never see a log line.
//!
//! [`EventLog`] subscribes to an [`EventHub`] and appends one JSON object per
//! lifecycle event to `{data_dir}/logs/events-{timestamp}.jsonl`. It uses
//! synchronous `std::fs`; writes are small and flushed after each event.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

use crate::orchestration::events::{EventHub, Subscription, TeamEvent};

/// Install the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Returns the current UTC time as an ISO 8601 string with milliseconds.
fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// One line of the event log.
#[derive(Debug, Serialize)]
struct LogLine<'a> {
    timestamp: String,
    name: &'static str,
    #[serde(flatten)]
    event: &'a TeamEvent,
}

/// Append-only JSONL writer for lifecycle events.
pub struct EventLog {
    writer: Mutex<BufWriter<fs::File>>,
    log_path: PathBuf,
}

impl EventLog {
    /// Create `events-{ISO8601}.jsonl` in `log_dir`, with colons replaced by
    /// dashes for filesystem safety.
    pub fn create(log_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string();
        let log_path = log_dir.join(format!("events-{stamp}.jsonl"));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            log_path,
        })
    }

    /// Serialize an event as a single JSON line and flush.
    pub fn record(&self, event: &TeamEvent) -> anyhow::Result<()> {
        let line = LogLine {
            timestamp: now_iso(),
            name: event.kind().name(),
            event,
        };
        let mut writer = self.writer.lock().unwrap();
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Record every event published on `hub` until the subscription is dropped
    /// from the hub.
    pub fn attach(self: &Arc<Self>, hub: &EventHub) -> Subscription {
        let log = self.clone();
        hub.on_any(move |event| {
            if let Err(e) = log.record(event) {
                tracing::warn!(path = %log.log_path.display(), error = %e, "Failed to write event log");
            }
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}
