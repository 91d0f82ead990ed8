//! Typed views over task and approval documents.

use std::path::Path;

use chrono::{DateTime, Utc};

use super::frontmatter::{Document, extract_action_section, extract_section};
use crate::channels::{ActionKind, ActionSpec, ChannelKind, ContentSource};

/// Timestamp format used in archived and audit filenames.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Filename without its extension.
pub fn stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

/// Archived filename: `<marker>_<timestamp>_<name>`.
pub fn archive_name(marker: &str, now: DateTime<Utc>, name: &str) -> String {
    format!("{marker}_{}_{name}", timestamp(now))
}

/// A work item deposited by a listener.
#[derive(Debug, Clone)]
pub struct TaskDocument {
    pub name: String,
    /// Raw frontmatter `type`, if any.
    pub task_type: Option<String>,
    /// Resolved kind. `None` when `type` is present but unrecognized.
    pub kind: Option<ChannelKind>,
    pub doc: Document,
}

impl TaskDocument {
    pub fn parse(name: impl Into<String>, text: &str) -> Self {
        let doc = Document::parse(text);
        let task_type = doc.frontmatter.text("type").map(String::from);
        let kind = ChannelKind::from_task_type(task_type.as_deref());
        Self {
            name: name.into(),
            task_type,
            kind,
            doc,
        }
    }
}

/// Actions an approval asks for, after filtering against its kind's table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedActions {
    pub actions: Vec<ActionKind>,
    /// Entries that are neither `ignore` nor valid for the kind.
    pub unknown: Vec<String>,
}

/// A human-facing proposal awaiting or holding approval.
#[derive(Debug, Clone)]
pub struct ApprovalDocument {
    pub name: String,
    pub approval_type: Option<String>,
    /// Resolved from `type`, or from the filename prefix when `type` is absent.
    pub kind: Option<ChannelKind>,
    pub doc: Document,
}

impl ApprovalDocument {
    pub fn parse(name: impl Into<String>, text: &str) -> Self {
        let name = name.into();
        let doc = Document::parse(text);
        let approval_type = doc.frontmatter.text("type").map(String::from);
        let kind = match approval_type.as_deref() {
            Some(t) => ChannelKind::from_approval_type(t),
            None => ChannelKind::from_approval_name(&name),
        };
        Self {
            name,
            approval_type,
            kind,
            doc,
        }
    }

    /// Task this approval was derived from.
    ///
    /// `source_task` in the frontmatter wins; otherwise the kind's filename
    /// prefix is stripped from the approval name.
    pub fn source_task(&self) -> Option<String> {
        if let Some(source) = self.doc.frontmatter.text("source_task") {
            return Some(source.to_string());
        }
        let kind = self.kind?;
        self.name
            .strip_prefix(kind.approval_prefix())
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    /// Requested action kinds, deduplicated in request order.
    pub fn requested_actions(&self) -> RequestedActions {
        let Some(kind) = self.kind else {
            return RequestedActions::default();
        };

        let raw: Vec<String> = match kind {
            // Email approvals name a single verb instead of a list.
            ChannelKind::Email => match self.doc.frontmatter.text("action") {
                None | Some("send_reply") | Some("send_email") => vec!["reply".to_string()],
                Some(other) => vec![other.to_string()],
            },
            ChannelKind::ContentDraft if self.doc.frontmatter.get("actions").is_none() => {
                vec!["post".to_string()]
            }
            _ => self.doc.frontmatter.list("actions"),
        };

        let mut requested = RequestedActions::default();
        for entry in raw {
            let lowered = entry.trim().to_ascii_lowercase();
            if lowered.is_empty() || lowered == "ignore" || lowered == "none" {
                continue;
            }
            match ActionKind::parse(&lowered).filter(|a| kind.action_spec(*a).is_some()) {
                Some(action) if !requested.actions.contains(&action) => requested.actions.push(action),
                Some(_) => {}
                None => requested.unknown.push(entry),
            }
        }
        requested
    }

    /// Generated text for an action, if its section is present and non-empty.
    pub fn content_for(&self, spec: &ActionSpec) -> Option<String> {
        let text = match spec.content {
            ContentSource::None => return None,
            ContentSource::Section(heading) => extract_section(&self.doc.body, heading),
            ContentSource::ActionSection(label) => extract_action_section(&self.doc.body, label),
        };
        (!text.is_empty()).then_some(text)
    }
}
