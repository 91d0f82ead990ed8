//! Filesystem-backed staged task store.
//!
//! The vault is a directory with one flat sub-directory per [`Stage`]. A
//! document is a file keyed by its name; moving between stages is a single
//! `rename`, so a concurrent reader sees it in exactly one stage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use super::document::{archive_name, timestamp};
use crate::error::StoreError;

const ARCHIVE_ATTEMPTS: usize = 10;

/// Pipeline stage. On-disk directory names are part of the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NeedsAction,
    Plans,
    PendingApproval,
    Approved,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::NeedsAction,
        Stage::Plans,
        Stage::PendingApproval,
        Stage::Approved,
        Stage::Done,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::NeedsAction => "Needs_Action",
            Self::Plans => "Plans",
            Self::PendingApproval => "Pending_Approval",
            Self::Approved => "Approved",
            Self::Done => "Done",
        }
    }

    /// Forward-only moves. Plans are never moved, only deleted, and nothing
    /// leaves `Done`.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;

        matches!(
            (self, target),
            (NeedsAction, Done) | (PendingApproval, Approved) | (PendingApproval, Done) | (Approved, Done)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// The staged container.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    pub fn path(&self, stage: Stage, name: &str) -> PathBuf {
        self.stage_dir(stage).join(name)
    }

    /// Create every stage directory.
    pub async fn ensure_layout(&self) -> Result<(), StoreError> {
        for stage in Stage::ALL {
            fs::create_dir_all(self.stage_dir(stage)).await?;
        }
        Ok(())
    }

    /// Document names in a stage, sorted. Hidden files and directories are
    /// skipped; a missing stage directory lists as empty.
    pub async fn list(&self, stage: Stage) -> Result<Vec<String>, StoreError> {
        let dir = self.stage_dir(stage);
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    pub async fn exists(&self, stage: Stage, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        Ok(fs::try_exists(self.path(stage, name)).await?)
    }

    pub async fn read(&self, stage: Stage, name: &str) -> Result<String, StoreError> {
        validate_name(name)?;
        match fs::read_to_string(self.path(stage, name)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                stage: stage.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a document, replacing any existing one. Goes through a hidden
    /// temp file so readers never see a partial document.
    pub async fn write(&self, stage: Stage, name: &str, content: &str) -> Result<(), StoreError> {
        validate_name(name)?;
        let dir = self.stage_dir(stage);
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, dir.join(name)).await?;
        Ok(())
    }

    /// Delete a document. Returns whether it existed.
    pub async fn delete(&self, stage: Stage, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        match fs::remove_file(self.path(stage, name)).await {
            Ok(()) => {
                debug!(stage = %stage, name, "Deleted document");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a document to another stage under the same name.
    pub async fn move_to(&self, name: &str, from: Stage, to: Stage) -> Result<(), StoreError> {
        self.move_as(name, from, to, name).await
    }

    /// Move a document to another stage, renaming it on the way.
    pub async fn move_as(
        &self,
        name: &str,
        from: Stage,
        to: Stage,
        new_name: &str,
    ) -> Result<(), StoreError> {
        validate_name(name)?;
        validate_name(new_name)?;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                name: name.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let source = self.path(from, name);
        if !fs::try_exists(&source).await? {
            return Err(StoreError::NotFound {
                stage: from.to_string(),
                name: name.to_string(),
            });
        }
        let target = self.path(to, new_name);
        if fs::try_exists(&target).await? {
            return Err(StoreError::AlreadyExists {
                stage: to.to_string(),
                name: new_name.to_string(),
            });
        }

        fs::create_dir_all(self.stage_dir(to)).await?;
        fs::rename(&source, &target).await?;
        debug!(from = %from, to = %to, name, new_name, "Moved document");
        Ok(())
    }

    /// Move a document into `Done` as `<marker>_<timestamp>_<name>`.
    ///
    /// Two archives within the same second get a numeric suffix instead of
    /// clobbering each other. Returns the archived name.
    pub async fn archive(
        &self,
        name: &str,
        from: Stage,
        marker: &str,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let base = archive_name(marker, now, name);
        let mut candidate = base.clone();
        for attempt in 1..=ARCHIVE_ATTEMPTS {
            match self.move_as(name, from, Stage::Done, &candidate).await {
                Ok(()) => return Ok(candidate),
                Err(StoreError::AlreadyExists { .. }) if attempt < ARCHIVE_ATTEMPTS => {
                    candidate = format!("{marker}_{}_{attempt}_{name}", timestamp(now));
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::AlreadyExists {
            stage: Stage::Done.to_string(),
            name: base,
        })
    }

    /// List every stage at once.
    pub async fn snapshot(&self) -> Result<StageIndex, StoreError> {
        let mut index = StageIndex::default();
        for stage in Stage::ALL {
            for name in self.list(stage).await? {
                index.insert(stage, name);
            }
        }
        Ok(index)
    }
}

/// Point-in-time stage membership.
///
/// The coordinator reads this once per phase and keeps it current as it
/// moves documents, instead of probing the filesystem for every check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageIndex {
    stages: BTreeMap<Stage, BTreeSet<String>>,
}

impl StageIndex {
    pub fn contains(&self, stage: Stage, name: &str) -> bool {
        self.stages.get(&stage).is_some_and(|s| s.contains(name))
    }

    pub fn insert(&mut self, stage: Stage, name: impl Into<String>) {
        self.stages.entry(stage).or_default().insert(name.into());
    }

    pub fn remove(&mut self, stage: Stage, name: &str) -> bool {
        self.stages.get_mut(&stage).is_some_and(|s| s.remove(name))
    }

    /// Record a completed move.
    pub fn record_move(&mut self, name: &str, from: Stage, to: Stage, new_name: &str) {
        self.remove(from, name);
        self.insert(to, new_name);
    }

    pub fn names(&self, stage: Stage) -> impl Iterator<Item = &str> {
        self.stages.get(&stage).into_iter().flatten().map(String::as_str)
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.stages.get(&stage).map_or(0, BTreeSet::len)
    }

    /// Stages holding `name`. More than one entry means the layout is broken.
    pub fn locate(&self, name: &str) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.contains(*stage, name))
            .collect()
    }
}
