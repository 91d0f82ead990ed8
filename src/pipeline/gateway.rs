//! Action executor gateway.
//!
//! Turns one approved document into an executor request, classifies the
//! per-action results, updates quota and session health, and archives the
//! approval together with the task it came from.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::audit::AuditLog;
use super::state::PipelineState;
use crate::channels::{ActionKind, Channel, ChannelKind, ContentSource, plan_name};
use crate::config::ExecutorConfig;
use crate::error::{Error, ExecutorError};
use crate::process::deadline::truncate_for_log;
use crate::process::{CommandSpec, run_with_deadline};
use crate::shutdown::Shutdown;
use crate::vault::{ApprovalDocument, Stage, TaskStore};

/// Slack on top of the executor's own deadline before the gateway gives up.
const EXECUTOR_GRACE: Duration = Duration::from_secs(10);

/// Per-action success map returned by an executor.
pub type ActionResults = BTreeMap<ActionKind, bool>;

/// What the executor is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRequest {
    pub channel: Channel,
    pub kind: ChannelKind,
    pub approval: String,
    pub actions: Vec<ActionKind>,
    /// Generated text per action, for actions that carry any.
    pub content: BTreeMap<ActionKind, String>,
    /// Where to act: recipient, thread, post id.
    pub target: BTreeMap<String, String>,
}

/// Something that performs actions on an external platform.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ActionResults, ExecutorError>;
}

/// Runs the channel's configured command with the request as JSON on stdin
/// and reads `{"<action>": bool, ...}` from stdout.
pub struct CommandExecutor {
    config: ExecutorConfig,
    workdir: PathBuf,
    shutdown: Shutdown,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig, workdir: impl Into<PathBuf>, shutdown: Shutdown) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            shutdown,
        }
    }
}

#[async_trait]
impl ActionExecutor for CommandExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ActionResults, ExecutorError> {
        let channel = request.channel;
        let command = CommandSpec::from_argv(&self.config.for_channel(channel).command)
            .ok_or_else(|| ExecutorError::NotConfigured {
                channel: channel.to_string(),
            })?
            .current_dir(&self.workdir);

        let input = serde_json::to_string(request)?;
        let output = run_with_deadline(
            &command,
            Some(&input),
            self.config.timeout_for(channel),
            &self.shutdown,
        )
        .await?;

        if !output.success() {
            return Err(ExecutorError::Failed {
                channel: channel.to_string(),
                reason: format!(
                    "exit code {:?}: {}",
                    output.code,
                    truncate_for_log(output.stderr.trim(), 200)
                ),
            });
        }

        parse_results(&output.stdout).ok_or_else(|| ExecutorError::InvalidOutput {
            channel: channel.to_string(),
            reason: truncate_for_log(output.stdout.trim(), 200),
        })
    }
}

/// Read the result map from executor stdout: either the whole output or its
/// last non-empty line must be a JSON object. Non-boolean and unknown entries
/// are ignored.
pub fn parse_results(stdout: &str) -> Option<ActionResults> {
    let trimmed = stdout.trim();
    let object = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(trimmed)
        .ok()
        .or_else(|| {
            let last = trimmed.lines().rev().find(|l| !l.trim().is_empty())?;
            serde_json::from_str(last.trim()).ok()
        })?;

    Some(
        object
            .iter()
            .filter_map(|(key, value)| Some((ActionKind::parse(key)?, value.as_bool()?)))
            .collect(),
    )
}

/// Classification of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failed { reason: String },
}

/// Classify per-action results.
///
/// Every requested action failing fails the dispatch, even when all of them
/// are non-critical; that pattern is what an expired session looks like.
/// Otherwise only a critical failure fails it. An action missing from the
/// results counts as failed.
pub fn evaluate(kind: ChannelKind, requested: &[ActionKind], results: &ActionResults) -> Verdict {
    if requested.is_empty() {
        return Verdict::Success;
    }
    let failed: Vec<ActionKind> = requested
        .iter()
        .copied()
        .filter(|a| !results.get(a).copied().unwrap_or(false))
        .collect();

    if failed.len() == requested.len() {
        return Verdict::Failed {
            reason: "every requested action failed".to_string(),
        };
    }
    let critical = failed
        .iter()
        .find(|a| kind.action_spec(**a).is_some_and(|s| s.critical));
    match critical {
        Some(action) => Verdict::Failed {
            reason: format!("critical action {action} failed"),
        },
        None => Verdict::Success,
    }
}

/// Required target metadata, or the name of what is missing.
fn build_target(kind: ChannelKind, approval: &ApprovalDocument) -> Result<BTreeMap<String, String>, &'static str> {
    let fm = &approval.doc.frontmatter;
    let mut target = BTreeMap::new();
    let mut copy = |key: &str| {
        if let Some(value) = fm.text(key) {
            target.insert(key.to_string(), value.to_string());
            true
        } else {
            false
        }
    };

    match kind {
        ChannelKind::Email => {
            let has_to = copy("to");
            let has_subject = copy("subject");
            copy("in_reply_to");
            copy("thread_id");
            if !has_to {
                return Err("to");
            }
            if !has_subject {
                return Err("subject");
            }
        }
        ChannelKind::FacebookDm | ChannelKind::InstagramDm => {
            let has_id = copy("thread_id");
            let has_url = copy("thread_url");
            copy("sender");
            if !has_id && !has_url {
                return Err("thread_id or thread_url");
            }
        }
        ChannelKind::Tweet => {
            copy("author");
            if !copy("tweet_id") {
                return Err("tweet_id");
            }
        }
        ChannelKind::LinkedinPost => {
            copy("author");
            if !copy("post_urn") {
                let Some(id) = fm.text("post_id") else {
                    return Err("post_urn or post_id");
                };
                let urn = if id.starts_with("urn:") {
                    id.to_string()
                } else {
                    format!("urn:li:activity:{id}")
                };
                target.insert("post_urn".to_string(), urn);
            }
        }
        ChannelKind::ContentDraft => {}
        ChannelKind::LedgerEvent => {
            copy("record_ref");
            copy("partner");
        }
    }
    Ok(target)
}

/// Final state of one approval after a gateway pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Quota exhausted; left in `Approved`.
    Deferred,
    Completed,
    Failed { reason: String },
    /// Unknown approval type; archived without execution.
    Unhandled,
}

impl DispatchOutcome {
    pub fn marker(&self) -> Option<&'static str> {
        match self {
            Self::Deferred => None,
            Self::Completed => Some("completed"),
            Self::Failed { .. } => Some("failed"),
            Self::Unhandled => Some("unhandled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub approval: String,
    pub kind: Option<ChannelKind>,
    pub outcome: DispatchOutcome,
    pub results: ActionResults,
    pub archived_as: Option<String>,
}

/// Executes approved documents.
pub struct ActionGateway {
    store: TaskStore,
    executor: Arc<dyn ActionExecutor>,
    audit: AuditLog,
    timeouts: ExecutorConfig,
}

impl ActionGateway {
    pub fn new(store: TaskStore, executor: Arc<dyn ActionExecutor>, audit: AuditLog, timeouts: ExecutorConfig) -> Self {
        Self {
            store,
            executor,
            audit,
            timeouts,
        }
    }

    /// Process one document in `Approved`.
    pub async fn execute(
        &self,
        name: &str,
        state: &mut PipelineState,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, Error> {
        let text = self.store.read(Stage::Approved, name).await?;
        let approval = ApprovalDocument::parse(name, &text);

        let Some(kind) = approval.kind else {
            warn!(
                approval = name,
                approval_type = ?approval.approval_type,
                "Unrecognized approval type, archiving without execution"
            );
            let archived = self.store.archive(name, Stage::Approved, "unhandled", now).await?;
            self.cleanup_source(approval.source_task(), now).await;
            return Ok(DispatchReport {
                approval: name.to_string(),
                kind: None,
                outcome: DispatchOutcome::Unhandled,
                results: ActionResults::new(),
                archived_as: Some(archived),
            });
        };
        let channel = kind.channel();

        if state.quota.remaining(channel, now).await? == Some(0) {
            info!(
                approval = name,
                channel = %channel,
                "Daily quota exhausted, leaving approval for a later cycle"
            );
            return Ok(DispatchReport {
                approval: name.to_string(),
                kind: Some(kind),
                outcome: DispatchOutcome::Deferred,
                results: ActionResults::new(),
                archived_as: None,
            });
        }

        let requested = approval.requested_actions();
        if !requested.unknown.is_empty() {
            warn!(
                approval = name,
                kind = %kind,
                unknown = ?requested.unknown,
                "Dropping actions this channel does not support"
            );
        }

        let results = self.run_actions(kind, &approval, &requested.actions).await;
        let verdict = evaluate(kind, &requested.actions, &results);

        let outcome = match verdict {
            Verdict::Success => {
                for (action, ok) in &results {
                    if !ok {
                        warn!(approval = name, action = %action, "Non-critical action failed");
                    }
                }
                if !requested.actions.is_empty() {
                    if let Err(e) = state.quota.record(channel, now).await {
                        error!(channel = %channel, error = %e, "Failed to record quota usage");
                    }
                    state.health.record_success(channel);
                }
                info!(approval = name, kind = %kind, results = ?results, "Dispatch completed");
                DispatchOutcome::Completed
            }
            Verdict::Failed { reason } => {
                warn!(approval = name, kind = %kind, results = ?results, reason = %reason, "Dispatch failed");
                if let Err(e) = state.health.record_failure(channel, now).await {
                    error!(channel = %channel, error = %e, "Failed to update session health state");
                }
                DispatchOutcome::Failed { reason }
            }
        };

        let reason = match &outcome {
            DispatchOutcome::Failed { reason } => Some(reason.as_str()),
            _ => None,
        };
        let record = serde_json::json!({
            "approval": name,
            "kind": kind,
            "channel": channel,
            "requested": requested.actions,
            "ignored": requested.unknown,
            "results": results,
            "outcome": outcome.marker(),
            "reason": reason,
            "timestamp": now.to_rfc3339(),
        });
        if let Err(e) = self.audit.dispatch(name, now, &record).await {
            warn!(approval = name, error = %e, "Failed to write dispatch audit record");
        }
        if let Err(e) = self
            .audit
            .activity(now, &format!("{} {name} ({kind})", outcome.marker().unwrap_or("deferred")))
            .await
        {
            warn!(error = %e, "Failed to append activity log");
        }

        let marker = outcome.marker().unwrap_or("completed");
        let archived = self.store.archive(name, Stage::Approved, marker, now).await?;
        self.cleanup_source(approval.source_task(), now).await;

        Ok(DispatchReport {
            approval: name.to_string(),
            kind: Some(kind),
            outcome,
            results,
            archived_as: Some(archived),
        })
    }

    /// Gather content and target, then call the executor. Actions that cannot
    /// be sent are recorded as failed without reaching it.
    async fn run_actions(
        &self,
        kind: ChannelKind,
        approval: &ApprovalDocument,
        requested: &[ActionKind],
    ) -> ActionResults {
        let mut results = ActionResults::new();
        if requested.is_empty() {
            return results;
        }

        let target = match build_target(kind, approval) {
            Ok(target) => target,
            Err(missing) => {
                warn!(approval = %approval.name, missing, "Approval lacks target metadata, nothing sent");
                return requested.iter().map(|a| (*a, false)).collect();
            }
        };

        let mut actions = Vec::new();
        let mut content = BTreeMap::new();
        for action in requested {
            let Some(spec) = kind.action_spec(*action) else {
                results.insert(*action, false);
                continue;
            };
            if matches!(spec.content, ContentSource::None) {
                actions.push(*action);
                continue;
            }
            match approval.content_for(spec) {
                Some(text) => {
                    content.insert(*action, text);
                    actions.push(*action);
                }
                None => {
                    warn!(approval = %approval.name, action = %action, "No content for action, skipping it");
                    results.insert(*action, false);
                }
            }
        }
        if actions.is_empty() {
            return results;
        }

        let channel = kind.channel();
        let request = ExecutionRequest {
            channel,
            kind,
            approval: approval.name.clone(),
            actions: actions.clone(),
            content,
            target,
        };
        let deadline = self.timeouts.timeout_for(channel) + EXECUTOR_GRACE;
        let returned = match tokio::time::timeout(deadline, self.executor.execute(&request)).await {
            Ok(Ok(returned)) => returned,
            Ok(Err(e)) => {
                warn!(approval = %approval.name, channel = %channel, error = %e, "Executor failed");
                ActionResults::new()
            }
            Err(_) => {
                warn!(approval = %approval.name, channel = %channel, ?deadline, "Executor timed out");
                ActionResults::new()
            }
        };
        for action in actions {
            results.insert(action, returned.get(&action).copied().unwrap_or(false));
        }
        results
    }

    /// Remove the plan and archive the originating task, if they are still
    /// around. Failures are logged; the approval is already archived.
    async fn cleanup_source(&self, source: Option<String>, now: DateTime<Utc>) {
        let Some(source) = source else {
            return;
        };
        if let Err(e) = self.store.delete(Stage::Plans, &plan_name(&source)).await {
            warn!(source = %source, error = %e, "Failed to delete plan");
        }
        match self.store.exists(Stage::NeedsAction, &source).await {
            Ok(true) => {
                if let Err(e) = self.store.archive(&source, Stage::NeedsAction, "processed", now).await {
                    warn!(source = %source, error = %e, "Failed to archive source task");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(source = %source, error = %e, "Failed to look up source task"),
        }
    }
}
