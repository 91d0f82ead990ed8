//! Coordinator poll cycle.
//!
//! Each cycle runs three phases:
//! 1. Reason about at most `max_reasoning_per_cycle` new tasks, in channel
//!    priority order.
//! 2. Execute every approved document, however large the backlog in phase 1.
//! 3. Fire due schedules.
//!
//! Nothing is held in memory between cycles except the quota, health and
//! "agent missing" state; the vault directories are the source of truth, so
//! a crash at any point is resumed by the next cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::audit::AuditLog;
use super::gateway::{ActionExecutor, ActionGateway, CommandExecutor, DispatchOutcome, DispatchReport};
use super::health::{CommandNotifier, LogNotifier, Notifier, SessionHealthMonitor};
use super::quota::QuotaTracker;
use super::reasoning::{AgentReasoner, Reasoner, ReasoningDispatcher};
use super::schedule::{ScheduleBook, Scheduler};
use super::state::{PipelineState, TaskState};
use crate::channels::{ChannelKind, Templates, plan_name, priority_key};
use crate::config::{Config, CoordinatorConfig};
use crate::error::{DispatchError, Error, StoreError};
use crate::process::CommandSpec;
use crate::shutdown::Shutdown;
use crate::vault::{Stage, StageIndex, TaskDocument, TaskStore};

/// Cycle pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub max_reasoning_per_cycle: usize,
    pub poll_interval: Duration,
}

impl From<&CoordinatorConfig> for CoordinatorSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            max_reasoning_per_cycle: config.max_reasoning_per_cycle,
            poll_interval: config.poll_interval(),
        }
    }
}

/// What happened to one task during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub name: String,
    pub kind: Option<ChannelKind>,
    /// States passed through, starting at `New`.
    pub path: Vec<TaskState>,
    pub detail: Option<String>,
}

impl TaskReport {
    pub fn new(name: impl Into<String>, kind: Option<ChannelKind>) -> Self {
        Self {
            name: name.into(),
            kind,
            path: vec![TaskState::New],
            detail: None,
        }
    }

    pub fn final_state(&self) -> Option<TaskState> {
        self.path.last().copied()
    }

    /// Record a move to `next`.
    pub fn transition_to(&mut self, next: TaskState) -> Result<(), String> {
        let current = self.final_state().unwrap_or(TaskState::New);
        if !current.can_transition_to(next) {
            return Err(format!("Cannot transition {} from {current} to {next}", self.name));
        }
        self.path.push(next);
        Ok(())
    }

    /// Like `transition_to`, but an illegal move is logged and dropped.
    fn advance(&mut self, next: TaskState) {
        if let Err(reason) = self.transition_to(next) {
            warn!(task = %self.name, %reason, "Illegal task transition ignored");
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub id: Uuid,
    pub tasks: Vec<TaskReport>,
    pub approvals: Vec<DispatchReport>,
    pub schedules_fired: Vec<String>,
    pub reasoning_dispatched: usize,
    /// Tasks left alone because their approval is already in flight.
    pub skipped: usize,
}

impl CycleReport {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            tasks: Vec::new(),
            approvals: Vec::new(),
            schedules_fired: Vec::new(),
            reasoning_dispatched: 0,
            skipped: 0,
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn approval(&self, name: &str) -> Option<&DispatchReport> {
        self.approvals.iter().find(|a| a.approval == name)
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.approvals.is_empty() && self.schedules_fired.is_empty()
    }

    fn log(&self) {
        if self.is_idle() {
            debug!(skipped = self.skipped, "Cycle idle");
            return;
        }
        let count = |wanted: fn(&DispatchOutcome) -> bool| {
            self.approvals.iter().filter(|a| wanted(&a.outcome)).count()
        };
        info!(
            tasks = self.tasks.len(),
            archived = self
                .tasks
                .iter()
                .filter(|t| t.final_state().is_some_and(|s| s.is_terminal()))
                .count(),
            reasoning_dispatched = self.reasoning_dispatched,
            skipped = self.skipped,
            completed = count(|o| matches!(o, DispatchOutcome::Completed)),
            failed = count(|o| matches!(o, DispatchOutcome::Failed { .. })),
            deferred = count(|o| matches!(o, DispatchOutcome::Deferred)),
            schedules = ?self.schedules_fired,
            "Cycle complete"
        );
    }
}

/// The single coordinator of the vault.
pub struct Coordinator {
    store: TaskStore,
    dispatcher: ReasoningDispatcher,
    gateway: ActionGateway,
    scheduler: Scheduler,
    state: PipelineState,
    settings: CoordinatorSettings,
    reasoning_disabled: bool,
}

impl Coordinator {
    pub fn new(
        store: TaskStore,
        dispatcher: ReasoningDispatcher,
        gateway: ActionGateway,
        scheduler: Scheduler,
        state: PipelineState,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            gateway,
            scheduler,
            state,
            settings,
            reasoning_disabled: false,
        }
    }

    /// Wire the shipped components from configuration.
    pub fn from_config(config: &Config, shutdown: &Shutdown) -> Result<Self, Error> {
        let paths = &config.paths;
        let store = TaskStore::new(paths.vault());
        let audit = AuditLog::new(paths.logs());

        let reasoner: Arc<dyn Reasoner> = Arc::new(AgentReasoner::new(
            &config.coordinator.agent_command,
            paths.workspace(),
            config.coordinator.reasoning_timeout(),
            audit.clone(),
            shutdown.clone(),
        )?);
        let dispatcher =
            ReasoningDispatcher::new(store.clone(), Templates::new(paths.templates()), reasoner);

        let executor: Arc<dyn ActionExecutor> = Arc::new(CommandExecutor::new(
            config.executor.clone(),
            paths.workspace(),
            shutdown.clone(),
        ));
        let gateway = ActionGateway::new(store.clone(), executor, audit, config.executor.clone());

        let notifier: Arc<dyn Notifier> = match CommandSpec::from_argv(&config.health.notify_command) {
            Some(command) => Arc::new(CommandNotifier::new(command, shutdown.clone())),
            None => Arc::new(LogNotifier),
        };
        let state = PipelineState::new(
            QuotaTracker::new(paths.state(), config.quota.clone()),
            SessionHealthMonitor::new(
                paths.state(),
                config.health.alert_threshold,
                config.health.cooldown(),
                notifier,
            ),
        );
        let scheduler = Scheduler::new(config.effective_schedules(), ScheduleBook::new(paths.state()));

        Ok(Self::new(
            store,
            dispatcher,
            gateway,
            scheduler,
            state,
            CoordinatorSettings::from(&config.coordinator),
        ))
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn reasoning_disabled(&self) -> bool {
        self.reasoning_disabled
    }

    /// Loop until shutdown.
    pub async fn run(&mut self, shutdown: &Shutdown) {
        info!(
            vault = %self.store.root().display(),
            poll_interval = ?self.settings.poll_interval,
            max_reasoning_per_cycle = self.settings.max_reasoning_per_cycle,
            "Coordinator started"
        );
        while !shutdown.is_triggered() {
            let id = Uuid::new_v4();
            let span = info_span!("cycle", id = %id);
            match self.cycle(id, Utc::now(), shutdown).instrument(span).await {
                Ok(report) => report.log(),
                Err(e) => error!(cycle = %id, error = %e, "Cycle failed"),
            }
            if !shutdown.sleep(self.settings.poll_interval).await {
                break;
            }
        }
        info!("Coordinator stopped");
    }

    /// Run one cycle now.
    pub async fn run_cycle(&mut self, shutdown: &Shutdown) -> Result<CycleReport, Error> {
        let id = Uuid::new_v4();
        let span = info_span!("cycle", id = %id);
        let report = self.cycle(id, Utc::now(), shutdown).instrument(span).await?;
        report.log();
        Ok(report)
    }

    /// Run one cycle with an explicit clock.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>, shutdown: &Shutdown) -> Result<CycleReport, Error> {
        self.cycle(Uuid::new_v4(), now, shutdown).await
    }

    async fn cycle(&mut self, id: Uuid, now: DateTime<Utc>, shutdown: &Shutdown) -> Result<CycleReport, Error> {
        let mut report = CycleReport::new(id);

        // A broken phase 1 must not hold up human approvals.
        if let Err(e) = self.reason_phase(now, shutdown, &mut report).await {
            error!(error = %e, "Reasoning phase failed");
        }
        self.execute_phase(now, shutdown, &mut report).await?;

        if !shutdown.is_triggered() && !self.reasoning_disabled {
            match self.scheduler.run_due(&self.dispatcher, now).await {
                Ok(fired) => report.schedules_fired = fired,
                Err(Error::Dispatch(DispatchError::AgentNotFound { program })) => {
                    self.disable_reasoning(&program);
                }
                Err(e) => error!(error = %e, "Schedule phase failed"),
            }
        }
        Ok(report)
    }

    fn disable_reasoning(&mut self, program: &str) {
        error!(
            program,
            "Reasoning agent executable not found; reasoning disabled until restart, approvals still execute"
        );
        self.reasoning_disabled = true;
    }

    async fn load_tasks(&self, index: &StageIndex) -> Result<Vec<TaskDocument>, Error> {
        let mut tasks = Vec::new();
        for name in index.names(Stage::NeedsAction) {
            match self.store.read(Stage::NeedsAction, name).await {
                Ok(text) => tasks.push(TaskDocument::parse(name, &text)),
                // Gone since the snapshot.
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        tasks.sort_by_cached_key(|t| priority_key(t.kind, &t.name));
        Ok(tasks)
    }

    async fn reason_phase(
        &mut self,
        now: DateTime<Utc>,
        shutdown: &Shutdown,
        report: &mut CycleReport,
    ) -> Result<(), Error> {
        let mut index = self.store.snapshot().await?;
        let tasks = self.load_tasks(&index).await?;

        for task in tasks {
            if shutdown.is_triggered() {
                break;
            }

            let Some(kind) = task.kind else {
                warn!(
                    task = %task.name,
                    task_type = ?task.task_type,
                    "Unrecognized task type, archiving without reasoning"
                );
                let mut task_report = TaskReport::new(&task.name, None);
                match self.store.archive(&task.name, Stage::NeedsAction, "unhandled", now).await {
                    Ok(archived) => {
                        index.record_move(&task.name, Stage::NeedsAction, Stage::Done, &archived);
                        task_report.advance(TaskState::Archived);
                        task_report.detail = Some(format!("unhandled as {archived}"));
                    }
                    Err(e) => {
                        error!(task = %task.name, error = %e, "Failed to archive unhandled task");
                        task_report.detail = Some(e.to_string());
                    }
                }
                report.tasks.push(task_report);
                continue;
            };

            let approval = kind.approval_name(&task.name);
            if index.contains(Stage::PendingApproval, &approval) || index.contains(Stage::Approved, &approval) {
                debug!(task = %task.name, approval = %approval, "Approval already in flight, skipping");
                report.skipped += 1;
                continue;
            }

            if self.reasoning_disabled || report.reasoning_dispatched >= self.settings.max_reasoning_per_cycle {
                continue;
            }

            report.reasoning_dispatched += 1;
            let mut task_report = TaskReport::new(&task.name, Some(kind));
            // A store error fails only this task.
            if let Err(e) = self.reason_task(&task, kind, now, &mut index, &mut task_report).await {
                error!(task = %task.name, error = %e, "Failed to process task, retrying next cycle");
                task_report.detail = Some(e.to_string());
            }
            report.tasks.push(task_report);
        }
        Ok(())
    }

    /// Reason about one task and settle it: awaiting approval, archived, or
    /// back to `New` for a retry.
    async fn reason_task(
        &mut self,
        task: &TaskDocument,
        kind: ChannelKind,
        now: DateTime<Utc>,
        index: &mut StageIndex,
        task_report: &mut TaskReport,
    ) -> Result<(), Error> {
        let approval = kind.approval_name(&task.name);
        let plan = plan_name(&task.name);
        if index.contains(Stage::Plans, &plan) {
            info!(task = %task.name, plan = %plan, "Removing orphaned plan before re-reasoning");
            self.store.delete(Stage::Plans, &plan).await?;
            index.remove(Stage::Plans, &plan);
        }

        task_report.advance(TaskState::Reasoning);
        let outcome = match self.dispatcher.dispatch_task(task, kind).await {
            Ok(outcome) => outcome,
            Err(DispatchError::AgentNotFound { program }) => {
                self.disable_reasoning(&program);
                task_report.advance(TaskState::New);
                task_report.detail = Some(format!("agent not found: {program}"));
                return Ok(());
            }
            Err(e) => {
                error!(task = %task.name, error = %e, "Could not dispatch task");
                task_report.advance(TaskState::New);
                task_report.detail = Some(e.to_string());
                return Ok(());
            }
        };

        // The agent writes the approval itself, so look on disk.
        let awaiting = self.store.exists(Stage::PendingApproval, &approval).await?
            || self.store.exists(Stage::Approved, &approval).await?;

        if awaiting {
            info!(task = %task.name, approval = %approval, "Approval created, awaiting human review");
            index.insert(Stage::PendingApproval, approval.clone());
            task_report.advance(TaskState::AwaitingApproval);
            task_report.detail = Some(format!("awaiting {approval}"));
        } else if outcome.is_success() {
            task_report.advance(TaskState::NoActionNeeded);
            self.store.delete(Stage::Plans, &plan).await?;
            let archived = self.store.archive(&task.name, Stage::NeedsAction, "processed", now).await?;
            index.record_move(&task.name, Stage::NeedsAction, Stage::Done, &archived);
            info!(task = %task.name, archived = %archived, "No action needed, task archived");
            task_report.advance(TaskState::Archived);
            task_report.detail = Some(format!("archived as {archived}"));
        } else {
            task_report.advance(TaskState::New);
            task_report.detail = Some(format!("{outcome:?}, retry next cycle"));
        }
        Ok(())
    }

    async fn execute_phase(
        &mut self,
        now: DateTime<Utc>,
        shutdown: &Shutdown,
        report: &mut CycleReport,
    ) -> Result<(), Error> {
        let mut approvals = self.store.list(Stage::Approved).await?;
        approvals.sort_by_cached_key(|name| priority_key(ChannelKind::from_approval_name(name), name));

        for name in approvals {
            if shutdown.is_triggered() {
                break;
            }
            match self.gateway.execute(&name, &mut self.state, now).await {
                Ok(dispatch) => report.approvals.push(dispatch),
                Err(e) => error!(approval = %name, error = %e, "Failed to process approval"),
            }
        }
        Ok(())
    }
}
