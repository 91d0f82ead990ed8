//! Process supervisor.
//!
//! Keeps a fixed, ordered set of long-running workers alive. Exits are noticed
//! on a health-check interval; restarts are scheduled after a per-process
//! delay, and a process that keeps dying inside its rapid-restart window is
//! left down for a backoff period instead of being restarted in a tight loop.

use std::collections::{HashSet, VecDeque};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::{debug, error, info, warn};

use super::deadline::CommandSpec;
use super::group::{self, GroupSignal};
use crate::config::{ProcessConfig, SupervisorConfig};
use crate::error::SupervisorError;
use crate::shutdown::Shutdown;

/// What to run and how to treat its exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub command: CommandSpec,
    pub restart_delay: Duration,
    pub max_rapid_restarts: usize,
    pub rapid_window: Duration,
}

impl ProcessSpec {
    pub fn from_config(config: &ProcessConfig, workdir: &Path) -> Result<Self, SupervisorError> {
        let command = CommandSpec::from_argv(&config.command)
            .ok_or_else(|| SupervisorError::EmptyCommand {
                name: config.name.clone(),
            })?
            .current_dir(workdir);
        Ok(Self {
            name: config.name.clone(),
            command,
            restart_delay: Duration::from_secs(config.restart_delay_secs),
            max_rapid_restarts: config.max_rapid_restarts.max(1),
            rapid_window: Duration::from_secs(config.rapid_window_secs),
        })
    }
}

/// Timing knobs shared by every managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub health_check_interval: Duration,
    pub backoff: Duration,
    pub stop_timeout: Duration,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            health_check_interval: Duration::from_secs(config.health_check_interval_secs.max(1)),
            backoff: Duration::from_secs(config.backoff_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }
}

/// Outcome of handling one observed exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Still inside an earlier backoff; nothing recorded.
    InBackoff { until: Instant },
    /// Too many restarts inside the window; restarts pause until `until`.
    EnterBackoff { until: Instant, restarts_in_window: usize },
    /// Respawn at `at`.
    Restart { at: Instant },
}

/// Restart bookkeeping for one process. Pure: the caller supplies `now`.
#[derive(Debug, Clone, Default)]
pub struct RestartPolicy {
    restart_times: VecDeque<Instant>,
    total_restarts: u64,
    backoff_until: Option<Instant>,
}

impl RestartPolicy {
    pub fn on_exit(&mut self, spec: &ProcessSpec, now: Instant, backoff: Duration) -> RestartDecision {
        if let Some(until) = self.backoff_until {
            if now < until {
                return RestartDecision::InBackoff { until };
            }
            self.backoff_until = None;
        }

        self.restart_times.push_back(now);
        while let Some(oldest) = self.restart_times.front() {
            if now.duration_since(*oldest) > spec.rapid_window {
                self.restart_times.pop_front();
            } else {
                break;
            }
        }

        let restarts_in_window = self.restart_times.len();
        if restarts_in_window >= spec.max_rapid_restarts {
            let until = now + backoff;
            self.backoff_until = Some(until);
            // Start the next window fresh once the backoff ends.
            self.restart_times.clear();
            return RestartDecision::EnterBackoff {
                until,
                restarts_in_window,
            };
        }

        self.total_restarts += 1;
        RestartDecision::Restart {
            at: now + spec.restart_delay,
        }
    }

    pub fn total_restarts(&self) -> u64 {
        self.total_restarts
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }
}

/// A supervised process and its live state.
#[derive(Debug)]
pub struct ManagedProcess {
    spec: ProcessSpec,
    child: Option<Child>,
    policy: RestartPolicy,
    restart_at: Option<Instant>,
    log_path: PathBuf,
}

impl ManagedProcess {
    fn new(spec: ProcessSpec, log_dir: &Path) -> Self {
        let log_path = log_dir.join(format!("{}.out.log", spec.name));
        Self {
            spec,
            child: None,
            policy: RestartPolicy::default(),
            restart_at: None,
            log_path,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn total_restarts(&self) -> u64 {
        self.policy.total_restarts()
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        self.policy.in_backoff(now)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn spawn(&mut self) -> Result<(), SupervisorError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let log_err = log.try_clone()?;

        let mut command = tokio::process::Command::from(self.spec.command.to_std());
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            name: self.spec.name.clone(),
            source,
        })?;
        info!(process = %self.spec.name, pid = ?child.id(), command = %self.spec.command, "Started process");
        self.child = Some(child);
        Ok(())
    }

    /// Poll the child. Returns true if it has exited since the last poll.
    fn reap(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => false,
            Ok(Some(status)) => {
                warn!(process = %self.spec.name, code = ?status.code(), "Process exited");
                self.child = None;
                true
            }
            Err(e) => {
                error!(process = %self.spec.name, error = %e, "Could not poll process, treating it as exited");
                self.child = None;
                true
            }
        }
    }
}

/// The supervisor.
#[derive(Debug)]
pub struct Supervisor {
    processes: Vec<ManagedProcess>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        specs: Vec<ProcessSpec>,
        settings: SupervisorSettings,
        log_dir: &Path,
    ) -> Result<Self, SupervisorError> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.clone()) {
                return Err(SupervisorError::DuplicateName {
                    name: spec.name.clone(),
                });
            }
        }
        std::fs::create_dir_all(log_dir)?;
        let processes = specs
            .into_iter()
            .map(|spec| ManagedProcess::new(spec, log_dir))
            .collect();
        Ok(Self {
            processes,
            settings,
        })
    }

    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    pub fn process(&self, name: &str) -> Option<&ManagedProcess> {
        self.processes.iter().find(|p| p.name() == name)
    }

    /// Start every process in table order. A process that fails to spawn is
    /// handled like one that exited.
    pub fn start_all(&mut self) {
        for process in &mut self.processes {
            if let Err(e) = process.spawn() {
                error!(process = %process.spec.name, error = %e, "Failed to start process");
            }
        }
    }

    /// Health check: notice exits and decide what to do about each.
    pub fn check(&mut self, now: Instant) {
        let backoff = self.settings.backoff;
        for process in &mut self.processes {
            let exited = process.reap();
            let down = !process.is_running() && process.restart_at.is_none();
            if !exited && !down {
                continue;
            }

            match process.policy.on_exit(&process.spec, now, backoff) {
                RestartDecision::InBackoff { .. } => {
                    debug!(process = %process.spec.name, "In backoff, not restarting");
                }
                RestartDecision::EnterBackoff {
                    until,
                    restarts_in_window,
                } => {
                    error!(
                        process = %process.spec.name,
                        restarts_in_window,
                        window_secs = process.spec.rapid_window.as_secs(),
                        backoff_secs = until.saturating_duration_since(now).as_secs(),
                        "Process is crash-looping, pausing restarts"
                    );
                }
                RestartDecision::Restart { at } => {
                    info!(
                        process = %process.spec.name,
                        delay_secs = process.spec.restart_delay.as_secs(),
                        total_restarts = process.policy.total_restarts(),
                        "Scheduling restart"
                    );
                    process.restart_at = Some(at);
                }
            }
        }
    }

    /// Respawn processes whose restart delay has elapsed.
    pub fn spawn_due(&mut self, now: Instant) {
        for process in &mut self.processes {
            match process.restart_at {
                Some(at) if at <= now => {
                    process.restart_at = None;
                    if let Err(e) = process.spawn() {
                        error!(process = %process.spec.name, error = %e, "Failed to restart process");
                    }
                }
                _ => {}
            }
        }
    }

    /// Run until shutdown, then stop every process.
    pub async fn run(&mut self, shutdown: &Shutdown) {
        info!(
            processes = ?self.processes.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "Supervisor starting"
        );
        self.start_all();

        let interval = self.settings.health_check_interval;
        let tick = interval.min(Duration::from_secs(1));
        let mut next_check = Instant::now() + interval;

        while !shutdown.is_triggered() {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.wait() => break,
            }
            let now = Instant::now();
            if now >= next_check {
                self.check(now);
                next_check = now + interval;
            }
            self.spawn_due(now);
        }

        self.stop_all().await;
        info!("Supervisor stopped");
    }

    /// Terminate every running process group, wait up to the stop timeout,
    /// then force-kill whatever is left.
    pub async fn stop_all(&mut self) {
        for process in &mut self.processes {
            process.restart_at = None;
            if let Some(pid) = process.pid() {
                info!(process = %process.spec.name, pid, "Stopping process");
                if let Err(e) = group::signal_group(pid, GroupSignal::Terminate) {
                    warn!(process = %process.spec.name, error = %e, "Failed to signal process group");
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.settings.stop_timeout;
        for process in &mut self.processes {
            let Some(mut child) = process.child.take() else {
                continue;
            };
            let pid = child.id();
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(_) => debug!(process = %process.spec.name, "Process stopped"),
                Err(_) => {
                    warn!(process = %process.spec.name, "Process ignored SIGTERM, killing");
                    if let Some(pid) = pid {
                        let _ = group::signal_group(pid, GroupSignal::Kill);
                    }
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
    }
}
