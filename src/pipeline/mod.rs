//! Task pipeline.
//!
//! Every task flows through the vault stages:
//! 1. A listener drops a task into `Needs_Action`
//! 2. The reasoning agent writes a plan and, if warranted, an approval into
//!    `Pending_Approval`
//! 3. A human moves the approval to `Approved`
//! 4. The gateway executes it and archives everything into `Done`
//!
//! **Nothing reaches an external platform without a human-approved document.**

pub mod audit;
pub mod coordinator;
pub mod gateway;
pub mod health;
pub mod quota;
pub mod reasoning;
pub mod schedule;
pub mod state;

pub use audit::AuditLog;
pub use coordinator::{Coordinator, CoordinatorSettings, CycleReport, TaskReport};
pub use gateway::{
    ActionExecutor, ActionGateway, ActionResults, CommandExecutor, DispatchOutcome, DispatchReport,
    ExecutionRequest, Verdict, evaluate,
};
pub use health::{Alert, CommandNotifier, LogNotifier, Notifier, SessionHealthMonitor};
pub use quota::{QuotaCounter, QuotaTracker};
pub use reasoning::{AgentReasoner, Reasoner, ReasoningDispatcher, ReasoningOutcome, ReasoningRequest};
pub use schedule::{ScheduleBook, Scheduler};
pub use state::{PipelineState, TaskState};
