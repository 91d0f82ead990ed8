//! Append-only audit trail of reasoning runs and executed dispatches.
//!
//! The log directory holds one file per event:
//! - `reasoning_<stem>_<timestamp>.log`: agent stdout and stderr
//! - `dispatch_<stem>_<timestamp>.json`: requested actions and their results
//! - `activity/YYYY-MM-DD.md`: a short human-readable line per event

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StateError;
use crate::vault::{stem, timestamp};

/// An entry in the audit directory listing.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub name: String,
    pub size: u64,
}

/// File-backed audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
        move |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Write (overwrite) a file in the log directory.
    pub async fn write(&self, name: &str, content: &str) -> Result<PathBuf, StateError> {
        let path = self.dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(Self::io_err(&path))?;
        }
        fs::write(&path, content).await.map_err(Self::io_err(&path))?;
        Ok(path)
    }

    /// Append a line to a file in the log directory (creates if missing).
    pub async fn append(&self, name: &str, line: &str) -> Result<(), StateError> {
        let path = self.dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(Self::io_err(&path))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(Self::io_err(&path))?;
        file.write_all(format!("{}\n", line.trim_end()).as_bytes())
            .await
            .map_err(Self::io_err(&path))?;
        Ok(())
    }

    /// Record the output of one reasoning run.
    pub async fn reasoning(
        &self,
        label: &str,
        now: DateTime<Utc>,
        stdout: &str,
        stderr: &str,
    ) -> Result<PathBuf, StateError> {
        let name = format!("reasoning_{}_{}.log", stem(label), timestamp(now));
        let content = format!("=== stdout ===\n{stdout}\n=== stderr ===\n{stderr}\n");
        self.write(&name, &content).await
    }

    /// Record one dispatched approval.
    pub async fn dispatch(
        &self,
        approval: &str,
        now: DateTime<Utc>,
        record: &serde_json::Value,
    ) -> Result<PathBuf, StateError> {
        let name = format!("dispatch_{}_{}.json", stem(approval), timestamp(now));
        let json = serde_json::to_string_pretty(record)?;
        self.write(&name, &json).await
    }

    /// Append to today's activity log.
    pub async fn activity(&self, now: DateTime<Utc>, message: &str) -> Result<(), StateError> {
        let name = format!("activity/{}.md", now.format("%Y-%m-%d"));
        let line = format!("- {} {}", now.format("%H:%M:%S UTC"), message);
        self.append(&name, &line).await
    }

    /// Top-level files in the log directory, sorted by name.
    pub async fn list(&self) -> Result<Vec<AuditEntry>, StateError> {
        let mut read_dir = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&self.dir)(e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(Self::io_err(&self.dir))? {
            let metadata = entry.metadata().await.map_err(Self::io_err(&self.dir))?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(AuditEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
