//! Reasoning dispatcher.
//!
//! Renders the kind's instruction template for one task and hands it to the
//! external reasoning agent. The agent reads the task and writes the plan
//! and (optionally) the approval document itself; the dispatcher only
//! reports how the run ended.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use super::audit::AuditLog;
use crate::channels::templates::render;
use crate::channels::{ChannelKind, Templates, plan_name};
use crate::error::{DeadlineError, DispatchError};
use crate::process::deadline::truncate_for_log;
use crate::process::{CommandSpec, run_with_deadline};
use crate::shutdown::Shutdown;
use crate::vault::{Stage, TaskDocument, TaskStore};

const STDERR_AUDIT_CHARS: usize = 2000;

/// One rendered instruction for the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningRequest {
    /// Task filename, or the approval filename for scheduled drafts.
    pub label: String,
    pub kind: ChannelKind,
    pub prompt: String,
    pub task_path: Option<PathBuf>,
    pub plan_path: Option<PathBuf>,
    pub approval_path: PathBuf,
}

/// How one agent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasoningOutcome {
    Completed { audit_path: Option<PathBuf> },
    Failed { code: Option<i32>, stderr: String },
    TimedOut,
    Cancelled,
}

impl ReasoningOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// The external reasoning agent.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Run the agent once. Only a configuration problem is an `Err`.
    async fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningOutcome, DispatchError>;
}

/// Runs the configured agent command with the prompt on stdin.
pub struct AgentReasoner {
    command: CommandSpec,
    timeout: Duration,
    audit: AuditLog,
    shutdown: Shutdown,
}

impl AgentReasoner {
    pub fn new(
        argv: &[String],
        workdir: impl Into<PathBuf>,
        timeout: Duration,
        audit: AuditLog,
        shutdown: Shutdown,
    ) -> Result<Self, DispatchError> {
        let command = CommandSpec::from_argv(argv)
            .ok_or(DispatchError::NoAgentCommand)?
            .current_dir(workdir);
        Ok(Self {
            command,
            timeout,
            audit,
            shutdown,
        })
    }

    async fn record(&self, label: &str, stdout: &str, stderr: &str) -> Option<PathBuf> {
        match self.audit.reasoning(label, Utc::now(), stdout, stderr).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(label, error = %e, "Failed to write reasoning audit record");
                None
            }
        }
    }
}

#[async_trait]
impl Reasoner for AgentReasoner {
    async fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningOutcome, DispatchError> {
        info!(label = %request.label, kind = %request.kind, "Dispatching to reasoning agent");
        let result =
            run_with_deadline(&self.command, Some(&request.prompt), self.timeout, &self.shutdown).await;

        match result {
            Ok(output) if output.success() => {
                info!(
                    label = %request.label,
                    elapsed_ms = output.elapsed.as_millis() as u64,
                    "Reasoning agent finished"
                );
                let audit_path = self.record(&request.label, &output.stdout, &output.stderr).await;
                Ok(ReasoningOutcome::Completed { audit_path })
            }
            Ok(output) => {
                let stderr = truncate_for_log(output.stderr.trim(), STDERR_AUDIT_CHARS);
                warn!(
                    label = %request.label,
                    code = ?output.code,
                    stderr = %truncate_for_log(&stderr, 200),
                    "Reasoning agent exited with an error, will retry next cycle"
                );
                let summary = format!("exit code: {:?}", output.code);
                self.record(&request.label, &summary, &stderr).await;
                Ok(ReasoningOutcome::Failed {
                    code: output.code,
                    stderr,
                })
            }
            Err(DeadlineError::NotFound { program }) => {
                error!(program = %program, "Reasoning agent executable not found");
                Err(DispatchError::AgentNotFound { program })
            }
            Err(DeadlineError::TimedOut { timeout, .. }) => {
                warn!(label = %request.label, ?timeout, "Reasoning agent timed out, process tree killed");
                Ok(ReasoningOutcome::TimedOut)
            }
            Err(DeadlineError::Cancelled { .. }) => Ok(ReasoningOutcome::Cancelled),
            Err(e) => {
                warn!(label = %request.label, error = %e, "Reasoning agent could not run");
                Ok(ReasoningOutcome::Failed {
                    code: None,
                    stderr: e.to_string(),
                })
            }
        }
    }
}

/// Builds requests from tasks and templates and forwards them to a
/// [`Reasoner`].
pub struct ReasoningDispatcher {
    store: TaskStore,
    templates: Templates,
    reasoner: Arc<dyn Reasoner>,
}

impl ReasoningDispatcher {
    pub fn new(store: TaskStore, templates: Templates, reasoner: Arc<dyn Reasoner>) -> Self {
        Self {
            store,
            templates,
            reasoner,
        }
    }

    fn path_vars(&self, kind: ChannelKind) -> Vec<(&'static str, String)> {
        vec![
            (
                "needs_action_dir",
                self.store.stage_dir(Stage::NeedsAction).display().to_string(),
            ),
            (
                "pending_dir",
                self.store.stage_dir(Stage::PendingApproval).display().to_string(),
            ),
            ("channel", kind.channel().to_string()),
            ("approval_type", kind.approval_type().to_string()),
        ]
    }

    /// Build the request for one task without running it.
    pub async fn prepare_task(
        &self,
        task: &TaskDocument,
        kind: ChannelKind,
    ) -> Result<ReasoningRequest, DispatchError> {
        let template = self.templates.load(kind).await?;
        let task_path = self.store.path(Stage::NeedsAction, &task.name);
        let plan_path = self.store.path(Stage::Plans, &plan_name(&task.name));
        let approval_path = self
            .store
            .path(Stage::PendingApproval, &kind.approval_name(&task.name));

        let mut vars = self.path_vars(kind);
        vars.extend([
            ("task_path", task_path.display().to_string()),
            ("task_name", task.name.clone()),
            ("plan_path", plan_path.display().to_string()),
            ("approval_path", approval_path.display().to_string()),
        ]);

        Ok(ReasoningRequest {
            label: task.name.clone(),
            kind,
            prompt: render(&template, &vars),
            task_path: Some(task_path),
            plan_path: Some(plan_path),
            approval_path,
        })
    }

    pub async fn dispatch_task(
        &self,
        task: &TaskDocument,
        kind: ChannelKind,
    ) -> Result<ReasoningOutcome, DispatchError> {
        let request = self.prepare_task(task, kind).await?;
        self.reasoner.reason(&request).await
    }

    /// Ask the agent for an original post, written straight into
    /// `Pending_Approval` as `approval_name`.
    pub async fn draft_content(&self, approval_name: &str) -> Result<ReasoningOutcome, DispatchError> {
        let kind = ChannelKind::ContentDraft;
        let template = self.templates.load(kind).await?;
        let approval_path = self.store.path(Stage::PendingApproval, approval_name);

        let mut vars = self.path_vars(kind);
        vars.extend([
            ("task_name", approval_name.to_string()),
            ("approval_path", approval_path.display().to_string()),
        ]);

        let request = ReasoningRequest {
            label: approval_name.to_string(),
            kind,
            prompt: render(&template, &vars),
            task_path: None,
            plan_path: None,
            approval_path,
        };
        self.reasoner.reason(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CapturingReasoner {
        requests: Mutex<Vec<ReasoningRequest>>,
    }

    #[async_trait]
    impl Reasoner for CapturingReasoner {
        async fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningOutcome, DispatchError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(ReasoningOutcome::Completed { audit_path: None })
        }
    }

    fn dispatcher(dir: &TempDir, reasoner: Arc<CapturingReasoner>) -> ReasoningDispatcher {
        ReasoningDispatcher::new(TaskStore::new(dir.path()), Templates::default(), reasoner)
    }

    #[tokio::test]
    async fn task_prompt_names_every_path() {
        let dir = TempDir::new().unwrap();
        let reasoner = Arc::new(CapturingReasoner::default());
        let dispatcher = dispatcher(&dir, reasoner.clone());
        let task = TaskDocument::parse("TWEET_9.md", "---\ntype: tweet\n---\n");

        let outcome = dispatcher.dispatch_task(&task, ChannelKind::Tweet).await.unwrap();
        assert!(outcome.is_success());

        let requests = reasoner.requests.lock().unwrap();
        let request = &requests[0];
        let approval = dir.path().join("Pending_Approval/ACTION_TWEET_TWEET_9.md");
        assert_eq!(request.approval_path, approval);
        assert!(request.prompt.contains(&approval.display().to_string()));
        assert!(request.prompt.contains(&dir.path().join("Plans/PLAN_TWEET_9.md").display().to_string()));
        assert!(request.prompt.contains(&dir.path().join("Needs_Action/TWEET_9.md").display().to_string()));
        assert!(!request.prompt.contains("{{"));
    }

    #[tokio::test]
    async fn draft_has_no_task() {
        let dir = TempDir::new().unwrap();
        let reasoner = Arc::new(CapturingReasoner::default());
        let dispatcher = dispatcher(&dir, reasoner.clone());

        dispatcher
            .draft_content("ACTION_LINKEDIN_POST_20260101_000000.md")
            .await
            .unwrap();
        let requests = reasoner.requests.lock().unwrap();
        assert_eq!(requests[0].kind, ChannelKind::ContentDraft);
        assert!(requests[0].task_path.is_none());
        assert!(requests[0].prompt.contains("ACTION_LINKEDIN_POST_20260101_000000.md"));
    }

    #[test]
    fn empty_agent_command_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = AgentReasoner::new(
            &[],
            dir.path(),
            Duration::from_secs(1),
            AuditLog::new(dir.path()),
            Shutdown::new(),
        );
        assert!(matches!(err, Err(DispatchError::NoAgentCommand)));
    }

    #[cfg(unix)]
    mod agent {
        use super::*;

        fn agent(dir: &TempDir, script: &str, timeout: Duration) -> AgentReasoner {
            let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
            AgentReasoner::new(&argv, dir.path(), timeout, AuditLog::new(dir.path().join("logs")), Shutdown::new())
                .unwrap()
        }

        fn request() -> ReasoningRequest {
            ReasoningRequest {
                label: "EMAIL_1.md".into(),
                kind: ChannelKind::Email,
                prompt: "triage this".into(),
                task_path: None,
                plan_path: None,
                approval_path: PathBuf::from("/nonexistent"),
            }
        }

        #[tokio::test]
        async fn success_writes_audit_record() {
            let dir = TempDir::new().unwrap();
            let reasoner = agent(&dir, "cat", Duration::from_secs(5));
            let outcome = reasoner.reason(&request()).await.unwrap();
            let ReasoningOutcome::Completed { audit_path: Some(path) } = outcome else {
                panic!("expected completed with audit, got {outcome:?}");
            };
            assert!(std::fs::read_to_string(path).unwrap().contains("triage this"));
        }

        #[tokio::test]
        async fn nonzero_exit_is_failed() {
            let dir = TempDir::new().unwrap();
            let reasoner = agent(&dir, "echo broken >&2; exit 3", Duration::from_secs(5));
            let outcome = reasoner.reason(&request()).await.unwrap();
            assert_eq!(
                outcome,
                ReasoningOutcome::Failed {
                    code: Some(3),
                    stderr: "broken".into()
                }
            );
        }

        #[tokio::test]
        async fn slow_agent_times_out() {
            let dir = TempDir::new().unwrap();
            let reasoner = agent(&dir, "sleep 10", Duration::from_millis(200));
            assert_eq!(reasoner.reason(&request()).await.unwrap(), ReasoningOutcome::TimedOut);
        }

        #[tokio::test]
        async fn missing_agent_is_config_error() {
            let dir = TempDir::new().unwrap();
            let argv = vec!["definitely-not-an-agent-binary".to_string()];
            let reasoner = AgentReasoner::new(
                &argv,
                dir.path(),
                Duration::from_secs(1),
                AuditLog::new(dir.path()),
                Shutdown::new(),
            )
            .unwrap();
            let err = reasoner.reason(&request()).await.unwrap_err();
            assert!(matches!(err, DispatchError::AgentNotFound { .. }));
        }

        #[tokio::test]
        async fn missing_workdir_is_a_retryable_failure() {
            let dir = TempDir::new().unwrap();
            let argv = vec!["sh".to_string(), "-c".to_string(), "cat".to_string()];
            let reasoner = AgentReasoner::new(
                &argv,
                dir.path().join("workspace"),
                Duration::from_secs(1),
                AuditLog::new(dir.path()),
                Shutdown::new(),
            )
            .unwrap();
            let outcome = reasoner.reason(&request()).await.unwrap();
            assert!(matches!(outcome, ReasoningOutcome::Failed { code: None, .. }), "got {outcome:?}");
        }
    }
}
