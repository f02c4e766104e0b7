//! Append-only fact log with file-based persistence.
//!
//! Each execution has its own directory holding `events.jsonl` (one
//! [`LogEntry`] per line) and, once the root pipeline settles, a
//! `snapshot.json` of the final aggregate.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dashmap::DashMap;
use fs2::FileExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::domain::{Envelope, Execution, LogEntry};

const LOG_FILE: &str = "events.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// File-based fact log using JSONL format
pub struct EventStore {
    /// Directory containing one subdirectory per execution
    base_dir: PathBuf,

    /// Last sequence number written per execution
    sequences: DashMap<String, u64>,
}

impl EventStore {
    /// Open a store rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sequences: DashMap::new(),
        }
    }

    /// Open the store under the configured home (~/.pipewright/executions)
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::config::executions_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn execution_dir(&self, execution_id: &str) -> PathBuf {
        self.base_dir.join(execution_id)
    }

    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join(LOG_FILE)
    }

    pub fn snapshot_path(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join(SNAPSHOT_FILE)
    }

    /// Whether any fact was ever recorded for the execution
    pub fn exists(&self, execution_id: &str) -> bool {
        self.log_path(execution_id).exists()
    }

    /// Append a batch of messages as consecutive log entries.
    ///
    /// The batch is written with a single write under an exclusive file
    /// lock. Callers must hold the execution's advisory lock so that
    /// sequence numbers are assigned by one writer at a time.
    pub async fn append_batch(&self, execution_id: &str, envelopes: &[Envelope]) -> Result<Vec<LogEntry>> {
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }

        let last = self.last_sequence(execution_id).await?;
        let entries = envelopes
            .iter()
            .enumerate()
            .map(|(i, envelope)| LogEntry::from_envelope(envelope, last + 1 + i as u64))
            .collect::<serde_json::Result<Vec<_>>>()
            .context("Failed to serialize fact")?;

        let mut buffer = String::new();
        for entry in &entries {
            buffer.push_str(&serde_json::to_string(entry).context("Failed to serialize log entry")?);
            buffer.push('\n');
        }

        let dir = self.execution_dir(execution_id);
        let path = self.log_path(execution_id);
        tokio::task::spawn_blocking(move || write_locked(&dir, &path, buffer.as_bytes()))
            .await
            .context("Log writer task failed")??;

        let next = last + entries.len() as u64;
        self.sequences.insert(execution_id.to_string(), next);
        debug!(execution_id, count = entries.len(), last_sequence = next, "Appended facts");

        Ok(entries)
    }

    /// Read all log entries in sequence order
    pub async fn replay(&self, execution_id: &str) -> Result<Vec<LogEntry>> {
        let path = self.log_path(execution_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut entries = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse log entry: {}", line))?;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Replay the log and rebuild the aggregate
    pub async fn load(&self, execution_id: &str) -> Result<Execution> {
        let entries = self.replay(execution_id).await?;
        let execution = Execution::from_log(execution_id, &entries)?;
        Ok(execution)
    }

    /// List all execution ids that have a log, sorted
    pub async fn list_executions(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if entry.path().join(LOG_FILE).exists() {
                    ids.push(name.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Write the final aggregate next to the log
    pub async fn write_snapshot(&self, execution: &Execution) -> Result<PathBuf> {
        let dir = self.execution_dir(&execution.id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create execution directory: {}", dir.display()))?;

        let path = self.snapshot_path(&execution.id);
        let tmp = dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        let json = serde_json::to_string_pretty(execution).context("Failed to serialize snapshot")?;

        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;

        Ok(path)
    }

    /// Read a previously written snapshot
    pub async fn read_snapshot(&self, execution_id: &str) -> Result<Option<Execution>> {
        let path = self.snapshot_path(execution_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        let execution = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

        Ok(Some(execution))
    }

    /// Drop the cached last sequence of an execution; the next append
    /// reads it back from the log
    pub fn forget(&self, execution_id: &str) {
        self.sequences.remove(execution_id);
    }

    #[cfg(test)]
    pub(crate) fn is_cached(&self, execution_id: &str) -> bool {
        self.sequences.contains_key(execution_id)
    }

    async fn last_sequence(&self, execution_id: &str) -> Result<u64> {
        if let Some(seq) = self.sequences.get(execution_id) {
            return Ok(*seq);
        }
        let last = self
            .replay(execution_id)
            .await?
            .last()
            .map(|entry| entry.sequence)
            .unwrap_or(0);
        self.sequences.insert(execution_id.to_string(), last);
        Ok(last)
    }
}

/// Append bytes to the log with an exclusive lock held for the write
fn write_locked(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create execution directory: {}", dir.display()))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    file.lock_exclusive()
        .context("Failed to acquire file lock on events.jsonl")?;

    file.write_all(bytes).context("Failed to write facts")?;
    file.flush().context("Failed to flush facts")?;

    // Lock is released when file is dropped
    Ok(())
}
