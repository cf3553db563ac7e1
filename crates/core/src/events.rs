#![forbid(unsafe_code)]

use crate::packet::VerdictStatus;
use crate::rules::RuleKind;
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Converts a capture timestamp (UNIX seconds) to RFC 3339.
pub fn unix_to_rfc3339(ts: f64) -> String {
    let secs = ts.div_euclid(1.0) as i64;
    let nanos = (ts.rem_euclid(1.0) * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One telemetry record, emitted as a single JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FirewallEvent {
    Decision {
        timestamp: String,
        ip: String,
        port: u16,
        protocol: String,
        request_id: u64,
        status: VerdictStatus,
        rule_type: Option<RuleKind>,
        reason: Option<String>,
        packets_in_window: u64,
    },
    Cleanup {
        timestamp: String,
        pruned: Vec<u64>,
    },
    Block {
        timestamp: String,
        ip: String,
        port: u16,
        protocol: String,
        reason: String,
    },
    Unblock {
        timestamp: String,
        ip: String,
        port: u16,
        protocol: String,
    },
}

/// Append-only JSONL sink for telemetry events.
pub struct EventWriter {
    file: File,
}

impl EventWriter {
    pub fn open(path: &Path) -> std::io::Result<EventWriter> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(EventWriter { file })
    }

    pub fn append(&mut self, event: &FirewallEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.file, "{line}")
    }
}
