//! Append-only audit logging of key-lifecycle events.
//!
//! Records every DEK creation, every rewrap performed by a roll and every
//! re-encryption. Records carry ids only, never key material or plaintext.
//! Each record is also emitted as a `tracing` event, and can be forwarded to
//! pluggable sinks (a JSON-lines file sink is built in).
//!
//! Sinks are called on the request path, so `AuditSink::append` must not
//! block. [`FileAuditSink`] hands records to a writer task over a channel.

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default number of records retained in memory.
pub const DEFAULT_RETENTION: usize = 10_000;

/// A sink that receives audit records. Implement this to forward records
/// to a file, database, S3, or other persistent store.
pub trait AuditSink: Send {
    /// Append a record. Called once for every audited event, from async
    /// request paths: hand slow work off rather than doing it inline.
    fn append(&mut self, record: AuditRecord);
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// A new DEK was generated and stored.
    DekCreated,
    /// A stored DEK record was rewrapped under the active KEK.
    DekRewrapped,
    /// Caller ciphertext was moved onto the ring's latest DEK.
    ReEncrypted,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DekCreated => "dek_created",
            Self::DekRewrapped => "dek_rewrapped",
            Self::ReEncrypted => "re_encrypted",
        }
    }
}

/// A permanent record of a key-lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation: AuditOperation,
    pub ring_id: String,
    /// The DEK id the event applies to.
    pub key_id: String,
    /// For re-encryption: the DEK the ciphertext was moved off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_key_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(operation: AuditOperation, ring_id: &str, key_id: &str) -> Self {
        Self {
            operation,
            ring_id: ring_id.to_string(),
            key_id: key_id.to_string(),
            previous_key_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_previous_key(mut self, previous: impl Into<String>) -> Self {
        self.previous_key_id = Some(previous.into());
        self
    }
}

/// An append-only log of recent records, safe to share across requests.
/// Older records beyond the retention limit are dropped from memory;
/// attach a sink to keep a durable copy.
///
/// Retained records and forward sinks sit behind separate locks, so
/// readers of the log never wait on a sink.
pub struct AuditLog {
    records: Mutex<VecDeque<AuditRecord>>,
    forward_sinks: Mutex<Vec<Box<dyn AuditSink>>>,
    retention: usize,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.lock().len())
            .field("forward_sinks", &self.forward_sinks.lock().len())
            .field("retention", &self.retention)
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            forward_sinks: Mutex::new(Vec::new()),
            retention,
        }
    }

    /// Add a sink to receive a copy of every record.
    pub fn add_forward_sink(&self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.lock().push(sink);
    }

    /// Append a new record to the log and forward to any attached sinks.
    pub fn append(&self, record: AuditRecord) {
        tracing::info!(
            target: "ringvault::audit",
            operation = record.operation.as_str(),
            ring_id = %record.ring_id,
            key_id = %record.key_id,
            previous_key_id = record.previous_key_id.as_deref(),
            "audit"
        );

        if self.retention > 0 {
            let mut records = self.records.lock();
            if records.len() == self.retention {
                records.pop_front();
            }
            records.push_back(record.clone());
        }

        for sink in self.forward_sinks.lock().iter_mut() {
            sink.append(record.clone());
        }
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the retained records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
///
/// `append` only queues the record; a tokio task owns the file and writes
/// and flushes each line in order.
pub struct FileAuditSink {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

/// Handle to the task behind a [`FileAuditSink`].
#[derive(Debug)]
pub struct FileAuditWriter {
    task: JoinHandle<()>,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging and start its
    /// writer task. Must be called from within a tokio runtime.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<(Self, FileAuditWriter)> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();

        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = write_line(&mut file, &record).await {
                    tracing::warn!(error = %e, "failed to write audit record");
                }
            }
        });

        Ok((Self { tx }, FileAuditWriter { task }))
    }
}

async fn write_line(file: &mut tokio::fs::File, record: &AuditRecord) -> io::Result<()> {
    let mut line = serde_json::to_vec(record).map_err(io::Error::other)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            tracing::warn!("audit writer has stopped, record dropped");
        }
    }
}

impl FileAuditWriter {
    /// Wait until every record queued before the sink was dropped is on disk.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "audit writer task failed");
        }
    }
}
