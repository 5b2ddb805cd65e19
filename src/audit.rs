//! Key-lifecycle audit trail.
//!
//! Records every outcome of the find-or-create sequence on the key vault.
//! The log is append-only and can forward records to pluggable sinks.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sink that receives audit records. Implement this to forward records to
/// a file, a database, or an alerting pipeline.
pub trait AuditSink: Send {
    /// Append a record. Called for every key-lifecycle event.
    fn append(&mut self, record: KeyAuditRecord);
}

/// What happened to the data-encryption key for an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAuditEvent {
    /// An existing key was found for the alias.
    Found,
    /// A new key was created for the alias.
    Created,
    /// The unique alias index rejected a second key for the alias.
    DuplicateRejected,
    /// More than one key carries the alias. Needs operator intervention.
    Divergent,
}

/// A permanent record of a key-lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAuditRecord {
    pub event: KeyAuditEvent,
    pub alias: String,
    /// Base64 key id, when the event concerns one specific key.
    pub key_id: Option<String>,
    /// The key-vault namespace.
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
}

impl KeyAuditRecord {
    pub fn new(event: KeyAuditEvent, alias: &str, key_id: Option<&str>, namespace: &str) -> Self {
        Self {
            event,
            alias: alias.to_string(),
            key_id: key_id.map(str::to_string),
            namespace: namespace.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// An append-only log of key-lifecycle events.
/// Can forward records to additional sinks via `add_forward_sink`.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<KeyAuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every record.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a new record to the log and forward it to any attached sinks.
    pub fn append(&mut self, record: KeyAuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyAuditRecord> {
        self.records.iter()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: KeyAuditRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(err) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
                    tracing::warn!(error = %err, "failed to write key audit record");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode key audit record"),
        }
    }
}
