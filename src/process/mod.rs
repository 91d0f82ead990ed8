//! External process plumbing: deadline-bounded runs, the worker supervisor
//! and the singleton lock.

pub mod deadline;
pub mod group;
pub mod lock;
pub mod supervisor;

pub use deadline::{CommandSpec, ProcessOutput, run_with_deadline};
pub use lock::SingletonLock;
pub use supervisor::{ProcessSpec, RestartDecision, RestartPolicy, Supervisor, SupervisorSettings};
