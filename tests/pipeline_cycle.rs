//! End-to-end coordinator cycles over a temporary vault.
//!
//! The reasoning agent and the action executor are replaced by in-process
//! fakes that write the same files and return the same results the real
//! commands would.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use inbox_pilot::channels::{ActionKind, Channel, ChannelKind, Templates};
use inbox_pilot::config::{ExecutorConfig, QuotaConfig, ScheduleAction, ScheduleConfig};
use inbox_pilot::error::{DispatchError, ExecutorError, NotifyError};
use inbox_pilot::pipeline::{
    ActionExecutor, ActionGateway, ActionResults, Alert, AuditLog, Coordinator, CoordinatorSettings,
    CycleReport, DispatchOutcome, ExecutionRequest, Notifier, PipelineState, QuotaTracker, Reasoner,
    ReasoningDispatcher, ReasoningOutcome, ReasoningRequest, ScheduleBook, Scheduler,
    SessionHealthMonitor, TaskState,
};
use inbox_pilot::shutdown::Shutdown;
use inbox_pilot::vault::{Stage, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentMode {
    /// Write a plan and an approval.
    Propose,
    /// Write a plan only.
    NothingToDo,
    /// Exit non-zero.
    Crash,
    /// Executable missing.
    Missing,
}

struct FakeAgent {
    mode: Mutex<AgentMode>,
    calls: Mutex<Vec<String>>,
}

impl FakeAgent {
    fn new(mode: AgentMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn proposal(kind: ChannelKind, label: &str) -> String {
    match kind {
        ChannelKind::ContentDraft => {
            "---\ntype: linkedin_post_action\n---\n\n# Proposed LinkedIn Post\n\nShip small.\n"
                .to_string()
        }
        _ => format!(
            "---\ntype: email_action\naction: send_reply\nto: \"a@example.com\"\nsubject: \"Re: hi\"\nsource_task: \"{label}\"\n---\n\n# Proposed Reply\n\nThanks!\n"
        ),
    }
}

#[async_trait]
impl Reasoner for FakeAgent {
    async fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningOutcome, DispatchError> {
        self.calls.lock().unwrap().push(request.label.clone());
        let mode = *self.mode.lock().unwrap();
        if mode == AgentMode::Missing {
            return Err(DispatchError::AgentNotFound {
                program: "claude".into(),
            });
        }
        if let Some(plan) = &request.plan_path {
            std::fs::write(plan, "plan").unwrap();
        }
        match mode {
            AgentMode::Propose => {
                std::fs::write(&request.approval_path, proposal(request.kind, &request.label)).unwrap();
                Ok(ReasoningOutcome::Completed { audit_path: None })
            }
            AgentMode::NothingToDo => Ok(ReasoningOutcome::Completed { audit_path: None }),
            AgentMode::Crash => Ok(ReasoningOutcome::Failed {
                code: Some(1),
                stderr: "boom".into(),
            }),
            AgentMode::Missing => unreachable!(),
        }
    }
}

#[derive(Default)]
struct FakeExecutor {
    fail_all: Mutex<bool>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl FakeExecutor {
    fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ActionResults, ExecutorError> {
        self.requests.lock().unwrap().push(request.clone());
        let ok = !*self.fail_all.lock().unwrap();
        Ok(request.actions.iter().map(|a| (*a, ok)).collect())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    store: TaskStore,
    state_dir: std::path::PathBuf,
    agent: Arc<FakeAgent>,
    executor: Arc<FakeExecutor>,
    notifier: Arc<RecordingNotifier>,
    coordinator: Coordinator,
    shutdown: Shutdown,
}

async fn harness_with(mode: AgentMode, cap: usize, schedules: Vec<ScheduleConfig>) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::new(dir.path().join("vault"));
    store.ensure_layout().await.unwrap();
    let state_dir = dir.path().join("state");

    let agent = FakeAgent::new(mode);
    let executor = Arc::new(FakeExecutor::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let dispatcher = ReasoningDispatcher::new(store.clone(), Templates::default(), agent.clone());
    let gateway = ActionGateway::new(
        store.clone(),
        executor.clone(),
        AuditLog::new(dir.path().join("logs")),
        ExecutorConfig::default(),
    );
    let state = PipelineState::new(
        QuotaTracker::new(&state_dir, QuotaConfig::default()),
        SessionHealthMonitor::new(&state_dir, 2, chrono::Duration::hours(24), notifier.clone()),
    );
    let scheduler = Scheduler::new(schedules, ScheduleBook::new(&state_dir));
    let coordinator = Coordinator::new(
        store.clone(),
        dispatcher,
        gateway,
        scheduler,
        state,
        CoordinatorSettings {
            max_reasoning_per_cycle: cap,
            poll_interval: Duration::from_secs(1),
        },
    );

    Harness {
        _dir: dir,
        store,
        state_dir,
        agent,
        executor,
        notifier,
        coordinator,
        shutdown: Shutdown::new(),
    }
}

async fn harness(mode: AgentMode) -> Harness {
    harness_with(mode, 3, Vec::new()).await
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

const EMAIL_TASK: &str = "---\ntype: email\nfrom: \"someone@example.com\"\nsubject: \"hi\"\n---\n\nHello there\n";

fn tweet_approval(actions: &str) -> String {
    format!(
        "---\ntype: tweet_action\ntweet_id: \"111\"\nactions: {actions}\nsource_task: \"TWEET_1.md\"\n---\n\n## Action 1: Reply\n\nGreat point!\n"
    )
}

/// Every recorded lifecycle starts at `New` and only takes legal steps.
fn assert_legal_paths(report: &CycleReport) {
    for task in &report.tasks {
        assert_eq!(task.path.first(), Some(&TaskState::New), "{}", task.name);
        for step in task.path.windows(2) {
            assert!(
                step[0].can_transition_to(step[1]),
                "{}: illegal step {} -> {}",
                task.name,
                step[0],
                step[1]
            );
        }
    }
}

#[tokio::test]
async fn task_with_nothing_to_do_is_archived() {
    let mut h = harness(AgentMode::NothingToDo).await;
    h.store.write(Stage::NeedsAction, "EMAIL_1.md", EMAIL_TASK).await.unwrap();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_legal_paths(&report);

    let task = report.task("EMAIL_1.md").unwrap();
    assert_eq!(
        task.path,
        vec![TaskState::New, TaskState::Reasoning, TaskState::NoActionNeeded, TaskState::Archived]
    );
    assert!(h.store.list(Stage::NeedsAction).await.unwrap().is_empty());
    assert!(h.store.list(Stage::Plans).await.unwrap().is_empty());
    assert_eq!(
        h.store.list(Stage::Done).await.unwrap(),
        vec!["processed_20260301_120000_EMAIL_1.md"]
    );
}

#[tokio::test]
async fn proposed_approval_keeps_task_and_is_not_reasoned_twice() {
    let mut h = harness(AgentMode::Propose).await;
    h.store.write(Stage::NeedsAction, "EMAIL_1.md", EMAIL_TASK).await.unwrap();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_eq!(
        report.task("EMAIL_1.md").unwrap().final_state(),
        Some(TaskState::AwaitingApproval)
    );
    assert_eq!(h.store.list(Stage::NeedsAction).await.unwrap(), vec!["EMAIL_1.md"]);
    assert_eq!(
        h.store.list(Stage::PendingApproval).await.unwrap(),
        vec!["REPLY_EMAIL_1.md"]
    );

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.reasoning_dispatched, 0);
    assert_eq!(h.agent.calls().len(), 1);
}

#[tokio::test]
async fn orphaned_plan_is_replaced() {
    let mut h = harness(AgentMode::Propose).await;
    h.store.write(Stage::NeedsAction, "EMAIL_1.md", EMAIL_TASK).await.unwrap();
    h.store.write(Stage::Plans, "PLAN_EMAIL_1.md", "stale").await.unwrap();

    h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();

    assert_eq!(h.agent.calls(), vec!["EMAIL_1.md"]);
    assert_eq!(h.store.read(Stage::Plans, "PLAN_EMAIL_1.md").await.unwrap(), "plan");
}

#[tokio::test]
async fn failed_reasoning_leaves_task_for_retry() {
    let mut h = harness(AgentMode::Crash).await;
    h.store.write(Stage::NeedsAction, "EMAIL_1.md", EMAIL_TASK).await.unwrap();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_legal_paths(&report);
    assert_eq!(report.task("EMAIL_1.md").unwrap().final_state(), Some(TaskState::New));
    assert_eq!(h.store.list(Stage::NeedsAction).await.unwrap(), vec!["EMAIL_1.md"]);

    // The partial plan is cleaned up by the orphan rule on the retry.
    *h.agent.mode.lock().unwrap() = AgentMode::NothingToDo;
    h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_eq!(h.agent.calls().len(), 2);
    assert!(h.store.list(Stage::NeedsAction).await.unwrap().is_empty());
    assert!(h.store.list(Stage::Plans).await.unwrap().is_empty());
}

#[tokio::test]
async fn reasoning_is_capped_per_cycle() {
    let mut h = harness(AgentMode::Propose).await;
    for i in 0..5 {
        h.store
            .write(Stage::NeedsAction, &format!("EMAIL_{i}.md"), EMAIL_TASK)
            .await
            .unwrap();
    }

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_eq!(report.reasoning_dispatched, 3);
    assert_eq!(h.agent.calls(), vec!["EMAIL_0.md", "EMAIL_1.md", "EMAIL_2.md"]);

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_eq!(report.reasoning_dispatched, 2);
    assert_eq!(report.skipped, 3);
}

#[tokio::test]
async fn replies_are_reasoned_before_engagement_and_ledger() {
    let mut h = harness_with(AgentMode::NothingToDo, 1, Vec::new()).await;
    h.store
        .write(Stage::NeedsAction, "A_linkedin.md", "---\ntype: linkedin_post\n---\n")
        .await
        .unwrap();
    h.store
        .write(Stage::NeedsAction, "B_ledger.md", "---\ntype: odoo_event\n---\n")
        .await
        .unwrap();
    h.store.write(Stage::NeedsAction, "Z_email.md", EMAIL_TASK).await.unwrap();

    h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_eq!(h.agent.calls(), vec!["Z_email.md", "A_linkedin.md", "B_ledger.md"]);
}

#[tokio::test]
async fn approved_item_executes_and_archives_everything() {
    let mut h = harness(AgentMode::NothingToDo).await;
    h.store
        .write(Stage::NeedsAction, "TWEET_1.md", "---\ntype: tweet\ntweet_id: \"111\"\n---\n")
        .await
        .unwrap();
    h.store.write(Stage::Plans, "PLAN_TWEET_1.md", "plan").await.unwrap();
    h.store
        .write(Stage::Approved, "ACTION_TWEET_TWEET_1.md", &tweet_approval("[\"reply\", \"like\"]"))
        .await
        .unwrap();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();

    // The task's approval is in flight, so it is not reasoned about.
    assert!(h.agent.calls().is_empty());
    let dispatch = report.approval("ACTION_TWEET_TWEET_1.md").unwrap();
    assert_eq!(dispatch.outcome, DispatchOutcome::Completed);

    let requests = h.executor.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].actions, vec![ActionKind::Reply, ActionKind::Like]);
    assert_eq!(requests[0].content[&ActionKind::Reply], "Great point!");
    assert_eq!(requests[0].target["tweet_id"], "111");

    let mut done = h.store.list(Stage::Done).await.unwrap();
    done.sort();
    assert_eq!(
        done,
        vec![
            "completed_20260301_120000_ACTION_TWEET_TWEET_1.md",
            "processed_20260301_120000_TWEET_1.md",
        ]
    );
    assert!(h.store.list(Stage::Plans).await.unwrap().is_empty());
    assert!(h.store.list(Stage::Approved).await.unwrap().is_empty());
    assert_eq!(
        h.coordinator.state().quota.remaining(Channel::X, t0()).await.unwrap(),
        Some(4)
    );
}

#[tokio::test]
async fn exhausted_quota_leaves_approval_in_place() {
    let mut h = harness(AgentMode::NothingToDo).await;
    std::fs::create_dir_all(&h.state_dir).unwrap();
    let counter = format!(
        "{{\"actions_today\": 5, \"window_start_time\": \"{}\"}}",
        (t0() - chrono::Duration::hours(1)).to_rfc3339()
    );
    std::fs::write(h.state_dir.join(".x_daily_actions.json"), &counter).unwrap();
    h.store
        .write(Stage::Approved, "ACTION_TWEET_T1.md", &tweet_approval("[\"like\"]"))
        .await
        .unwrap();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();

    assert_eq!(
        report.approval("ACTION_TWEET_T1.md").unwrap().outcome,
        DispatchOutcome::Deferred
    );
    assert_eq!(h.store.list(Stage::Approved).await.unwrap(), vec!["ACTION_TWEET_T1.md"]);
    assert!(h.executor.requests().is_empty());
    let after = std::fs::read_to_string(h.state_dir.join(".x_daily_actions.json")).unwrap();
    assert_eq!(after, counter);
}

#[tokio::test]
async fn repeated_total_failure_alerts_once() {
    let mut h = harness(AgentMode::NothingToDo).await;
    *h.executor.fail_all.lock().unwrap() = true;

    for round in 0..3 {
        for name in ["a", "b"] {
            h.store
                .write(
                    Stage::Approved,
                    &format!("ACTION_TWEET_{round}{name}.md"),
                    &tweet_approval("[\"like\", \"retweet\"]"),
                )
                .await
                .unwrap();
        }
        let now = t0() + chrono::Duration::hours(round);
        let report = h.coordinator.run_cycle_at(now, &h.shutdown).await.unwrap();
        assert!(
            report
                .approvals
                .iter()
                .all(|a| matches!(a.outcome, DispatchOutcome::Failed { .. }))
        );
    }

    let alerts = h.notifier.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].channel, Channel::X);
    drop(alerts);

    let done = h.store.list(Stage::Done).await.unwrap();
    assert_eq!(done.len(), 6);
    assert!(done.iter().all(|n| n.starts_with("failed_")));
    // failures consume no quota
    assert_eq!(
        h.coordinator.state().quota.remaining(Channel::X, t0()).await.unwrap(),
        Some(5)
    );
}

#[tokio::test]
async fn unknown_task_type_is_archived_unhandled() {
    let mut h = harness(AgentMode::Propose).await;
    h.store
        .write(Stage::NeedsAction, "PIGEON_1.md", "---\ntype: carrier_pigeon\n---\n")
        .await
        .unwrap();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();

    assert!(h.agent.calls().is_empty());
    assert_eq!(report.task("PIGEON_1.md").unwrap().kind, None);
    assert_eq!(
        h.store.list(Stage::Done).await.unwrap(),
        vec!["unhandled_20260301_120000_PIGEON_1.md"]
    );
}

#[tokio::test]
async fn missing_agent_disables_reasoning_but_not_approvals() {
    let mut h = harness(AgentMode::Missing).await;
    h.store.write(Stage::NeedsAction, "EMAIL_1.md", EMAIL_TASK).await.unwrap();
    h.store.write(Stage::NeedsAction, "EMAIL_2.md", EMAIL_TASK).await.unwrap();
    h.store
        .write(Stage::Approved, "ACTION_TWEET_T1.md", &tweet_approval("[\"like\"]"))
        .await
        .unwrap();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert!(h.coordinator.reasoning_disabled());
    assert_eq!(h.agent.calls(), vec!["EMAIL_1.md"]);
    assert_eq!(
        report.approval("ACTION_TWEET_T1.md").unwrap().outcome,
        DispatchOutcome::Completed
    );

    h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_eq!(h.agent.calls().len(), 1);
    assert_eq!(h.store.list(Stage::NeedsAction).await.unwrap().len(), 2);
}

#[tokio::test]
async fn interval_schedule_drafts_content() {
    let schedule = ScheduleConfig {
        name: "linkedin_post".into(),
        action: ScheduleAction::ContentDraft,
        interval_hours: Some(1),
        cron: None,
        enabled: true,
    };
    let mut h = harness_with(AgentMode::Propose, 3, vec![schedule]).await;

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_eq!(report.schedules_fired, vec!["linkedin_post"]);
    assert_eq!(
        h.store.list(Stage::PendingApproval).await.unwrap(),
        vec!["ACTION_LINKEDIN_POST_20260301_120000.md"]
    );

    let later = t0() + chrono::Duration::minutes(30);
    let report = h.coordinator.run_cycle_at(later, &h.shutdown).await.unwrap();
    assert!(report.schedules_fired.is_empty());

    let next = t0() + chrono::Duration::minutes(61);
    let report = h.coordinator.run_cycle_at(next, &h.shutdown).await.unwrap();
    assert_eq!(report.schedules_fired.len(), 1);
    assert_eq!(h.store.list(Stage::PendingApproval).await.unwrap().len(), 2);
}

#[tokio::test]
async fn approved_content_draft_posts() {
    let mut h = harness(AgentMode::NothingToDo).await;
    h.store
        .write(
            Stage::Approved,
            "ACTION_LINKEDIN_POST_20260301_110000.md",
            &proposal(ChannelKind::ContentDraft, ""),
        )
        .await
        .unwrap();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    let dispatch = report.approval("ACTION_LINKEDIN_POST_20260301_110000.md").unwrap();
    assert_eq!(dispatch.kind, Some(ChannelKind::ContentDraft));
    assert_eq!(dispatch.outcome, DispatchOutcome::Completed);

    let requests = h.executor.requests();
    assert_eq!(requests[0].channel, Channel::LinkedIn);
    assert_eq!(
        requests[0].content,
        BTreeMap::from([(ActionKind::Post, "Ship small.".to_string())])
    );
}

#[tokio::test]
async fn triggered_shutdown_stops_between_items() {
    let mut h = harness(AgentMode::Propose).await;
    h.store.write(Stage::NeedsAction, "EMAIL_1.md", EMAIL_TASK).await.unwrap();
    h.store
        .write(Stage::Approved, "ACTION_TWEET_T1.md", &tweet_approval("[\"like\"]"))
        .await
        .unwrap();
    h.shutdown.trigger();

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert!(report.is_idle());
    assert!(h.agent.calls().is_empty());
    assert_eq!(h.store.list(Stage::Approved).await.unwrap().len(), 1);
}

#[tokio::test]
async fn every_recorded_lifecycle_is_legal() {
    let mut h = harness_with(AgentMode::Propose, 10, Vec::new()).await;
    h.store.write(Stage::NeedsAction, "EMAIL_1.md", EMAIL_TASK).await.unwrap();
    h.store
        .write(Stage::NeedsAction, "PIGEON_1.md", "---\ntype: carrier_pigeon\n---\n")
        .await
        .unwrap();
    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_legal_paths(&report);

    *h.agent.mode.lock().unwrap() = AgentMode::NothingToDo;
    h.store.write(Stage::NeedsAction, "EMAIL_2.md", EMAIL_TASK).await.unwrap();
    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_legal_paths(&report);

    *h.agent.mode.lock().unwrap() = AgentMode::Crash;
    h.store.write(Stage::NeedsAction, "EMAIL_3.md", EMAIL_TASK).await.unwrap();
    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_legal_paths(&report);

    *h.agent.mode.lock().unwrap() = AgentMode::Missing;
    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_legal_paths(&report);
    assert_eq!(
        report.task("EMAIL_3.md").unwrap().path,
        vec![TaskState::New, TaskState::Reasoning, TaskState::New]
    );
}

#[tokio::test]
async fn store_failure_on_one_task_does_not_block_the_rest() {
    let mut h = harness(AgentMode::NothingToDo).await;
    h.store.write(Stage::NeedsAction, "EMAIL_1.md", EMAIL_TASK).await.unwrap();
    h.store.write(Stage::NeedsAction, "EMAIL_2.md", EMAIL_TASK).await.unwrap();
    // Occupy every archive slot EMAIL_1 could take this second.
    h.store
        .write(Stage::Done, "processed_20260301_120000_EMAIL_1.md", "")
        .await
        .unwrap();
    for n in 1..10 {
        h.store
            .write(Stage::Done, &format!("processed_20260301_120000_{n}_EMAIL_1.md"), "")
            .await
            .unwrap();
    }

    let report = h.coordinator.run_cycle_at(t0(), &h.shutdown).await.unwrap();
    assert_legal_paths(&report);

    let stuck = report.task("EMAIL_1.md").unwrap();
    assert_ne!(stuck.final_state(), Some(TaskState::Archived));
    assert!(stuck.detail.as_deref().is_some_and(|d| d.contains("already exists")));
    assert_eq!(
        report.task("EMAIL_2.md").unwrap().final_state(),
        Some(TaskState::Archived)
    );
    assert_eq!(h.store.list(Stage::NeedsAction).await.unwrap(), vec!["EMAIL_1.md"]);
    assert_eq!(h.agent.calls(), vec!["EMAIL_1.md", "EMAIL_2.md"]);
}
