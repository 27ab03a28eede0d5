//! `EventSink` — durable, append-only log of every message and verdict.
//!
//! The core never reads this log back; it is a write-only contract
//! satisfied by whatever durable store the deployment chooses. The default
//! implementation appends JSON lines to a file.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("append-only log write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("entry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(
        &self,
        owner_id: &str,
        conversation_id: &str,
        sequence: u64,
        payload: &Value,
    ) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    owner_id: &'a str,
    conversation_id: &'a str,
    sequence: u64,
    payload: &'a Value,
    recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Append-only JSON-lines file sink. One writer task serializes all
/// appends; the underlying file is opened in append mode so concurrent
/// process restarts never truncate history.
pub struct FileEventSink {
    file: Mutex<File>,
}

impl FileEventSink {
    pub async fn open(path: PathBuf) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { file: Mutex::new(file) })
    }
}

#[async_trait]
impl EventSink for FileEventSink {
    async fn append(
        &self,
        owner_id: &str,
        conversation_id: &str,
        sequence: u64,
        payload: &Value,
    ) -> Result<(), SinkError> {
        let entry = AuditEntry { owner_id, conversation_id, sequence, payload, recorded_at: chrono::Utc::now() };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory sink for tests — keeps every appended entry for assertion.
pub struct MemoryEventSink {
    entries: Mutex<Vec<(String, String, u64, Value)>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    pub async fn entries(&self) -> Vec<(String, String, u64, Value)> {
        self.entries.lock().await.clone()
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(
        &self,
        owner_id: &str,
        conversation_id: &str,
        sequence: u64,
        payload: &Value,
    ) -> Result<(), SinkError> {
        self.entries.lock().await.push((owner_id.to_string(), conversation_id.to_string(), sequence, payload.clone()));
        Ok(())
    }
}
