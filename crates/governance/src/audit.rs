//! Audit event sinks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_sandbox_core::events::{EventEnvelope, EventSeverity};
use agent_sandbox_core::traits::EventEmitter;
use agent_sandbox_core::{Error, Result};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// An entry in the tamper-evident audit log.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub envelope: EventEnvelope,
    /// Hash of the previous entry.
    pub prev_hash: String,
    /// SHA-256 over `prev_hash` and the serialized envelope.
    pub hash: String,
}

fn chain_hash(prev_hash: &str, envelope_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(envelope_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash-chained JSONL audit log.
pub struct AuditLog {
    file_path: PathBuf,
    last_hash: String,
}

impl AuditLog {
    /// Create or open an audit log, resuming the chain from its last entry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = path.into();
        let mut last_hash = GENESIS_HASH.to_string();

        if file_path.exists() {
            let reader = BufReader::new(File::open(&file_path)?);
            if let Some(last_line) = reader.lines().last() {
                let entry: AuditEntry = serde_json::from_str(&last_line?)?;
                last_hash = entry.hash;
            }
        } else if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            file_path,
            last_hash,
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Append a new event to the audit log.
    pub fn append(&mut self, envelope: EventEnvelope) -> Result<()> {
        let envelope_json = serde_json::to_string(&envelope)?;
        let hash = chain_hash(&self.last_hash, &envelope_json);

        let entry = AuditEntry {
            envelope,
            prev_hash: self.last_hash.clone(),
            hash: hash.clone(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;

        self.last_hash = hash;
        Ok(())
    }

    /// Check the whole chain. Returns the number of entries.
    pub fn verify(path: &Path) -> Result<usize> {
        let reader = BufReader::new(File::open(path)?);
        let mut prev_hash = GENESIS_HASH.to_string();
        let mut count = 0;

        for (idx, line) in reader.lines().enumerate() {
            let entry: AuditEntry = serde_json::from_str(&line?)?;
            let expected = chain_hash(&prev_hash, &serde_json::to_string(&entry.envelope)?);
            if entry.prev_hash != prev_hash || entry.hash != expected {
                return Err(Error::internal(format!(
                    "audit log chain broken at line {}",
                    idx + 1
                )));
            }
            prev_hash = entry.hash;
            count += 1;
        }
        Ok(count)
    }
}

/// Event emitter that writes every event to an [`AuditLog`].
pub struct AuditLogEmitter {
    log: tokio::sync::Mutex<AuditLog>,
}

impl AuditLogEmitter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            log: tokio::sync::Mutex::new(AuditLog::open(path)?),
        })
    }
}

#[async_trait]
impl EventEmitter for AuditLogEmitter {
    async fn emit(&self, event: EventEnvelope) {
        let mut log = self.log.lock().await;
        if let Err(e) = log.append(event) {
            tracing::error!(path = %log.path().display(), error = %e, "Failed to record audit entry");
        }
    }
}

/// Event emitter that logs events through `tracing` under the `audit` target.
pub struct TracingEventEmitter;

#[async_trait]
impl EventEmitter for TracingEventEmitter {
    async fn emit(&self, event: EventEnvelope) {
        let event_type = format!("{:?}", event.event_type);
        let session_id = event.session_id.as_deref().unwrap_or("-");
        match event.severity {
            EventSeverity::Error => tracing::error!(target: "audit", event_type = %event_type, session_id = %session_id, actor = %event.actor, payload = %event.payload),
            EventSeverity::Warning => tracing::warn!(target: "audit", event_type = %event_type, session_id = %session_id, actor = %event.actor, payload = %event.payload),
            EventSeverity::Info => tracing::info!(target: "audit", event_type = %event_type, session_id = %session_id, actor = %event.actor, payload = %event.payload),
            EventSeverity::Debug => tracing::debug!(target: "audit", event_type = %event_type, session_id = %session_id, actor = %event.actor, payload = %event.payload),
        }
    }
}

/// Composite event emitter for multiple subscribers.
pub struct CompositeEventEmitter {
    emitters: Vec<Arc<dyn EventEmitter>>,
}

impl CompositeEventEmitter {
    pub fn new(emitters: Vec<Arc<dyn EventEmitter>>) -> Self {
        Self { emitters }
    }
}

#[async_trait]
impl EventEmitter for CompositeEventEmitter {
    async fn emit(&self, event: EventEnvelope) {
        for emitter in &self.emitters {
            emitter.emit(event.clone()).await;
        }
    }
}
