//! Task lifecycle state machine and the shared mutable pipeline state.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::fs;

use super::health::SessionHealthMonitor;
use super::quota::QuotaTracker;
use crate::error::StateError;

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Sitting in `Needs_Action`, not yet reasoned about.
    New,
    /// The reasoning agent is working on it.
    Reasoning,
    /// The agent decided nothing should be done.
    NoActionNeeded,
    /// An approval document is waiting for a human.
    AwaitingApproval,
    /// A human approved the proposed action.
    Approved,
    /// The action executor is running.
    Executing,
    /// Moved to `Done`.
    Archived,
}

impl TaskState {
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            // From New (unrecognized kinds are archived directly)
            (New, Reasoning) | (New, Archived) |
            // From Reasoning (a failed run goes back to New for a retry)
            (Reasoning, NoActionNeeded) | (Reasoning, AwaitingApproval) | (Reasoning, New) |
            (NoActionNeeded, Archived) |
            (AwaitingApproval, Approved) |
            // Approved stays Approved while its quota is exhausted
            (Approved, Executing) |
            (Executing, Archived)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Reasoning => "reasoning",
            Self::NoActionNeeded => "no_action_needed",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

/// Per-channel counters that outlive a single cycle.
///
/// Owned by the coordinator and lent to each component, so nothing reaches
/// for process-wide globals.
pub struct PipelineState {
    pub quota: QuotaTracker,
    pub health: SessionHealthMonitor,
}

impl PipelineState {
    pub fn new(quota: QuotaTracker, health: SessionHealthMonitor) -> Self {
        Self { quota, health }
    }
}

/// Accept RFC 3339 timestamps and the offset-less ISO form older state files
/// were written with (read as UTC).
pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Read a small JSON record. Missing files are `Ok(None)`; unreadable or
/// unparsable ones are errors the caller may choose to treat as absent.
pub(crate) async fn load_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Write a small JSON record through a temp file and rename.
pub(crate) async fn save_record<T: Serialize>(path: &Path, record: &T) -> Result<(), StateError> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
