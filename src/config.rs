//! Configuration types.
//!
//! Everything has a default, so an empty (or absent) `inbox-pilot.toml`
//! yields a working configuration rooted at the current directory. A small
//! set of `INBOX_PILOT_*` environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channels::Channel;
use crate::error::ConfigError;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "inbox-pilot.toml";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub coordinator: CoordinatorConfig,
    pub quota: QuotaConfig,
    pub executor: ExecutorConfig,
    pub health: HealthConfig,
    pub schedules: Vec<ScheduleConfig>,
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `inbox-pilot.toml` in the
    /// working directory is used when present. Environment overrides are
    /// applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw).map_err(|message| ConfigError::ParseError {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    /// Apply `INBOX_PILOT_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(base) = std::env::var("INBOX_PILOT_BASE_DIR") {
            self.paths.base_dir = PathBuf::from(base);
        }
        if let Ok(vault) = std::env::var("INBOX_PILOT_VAULT") {
            self.paths.vault_dir = Some(PathBuf::from(vault));
        }
        if let Ok(cmd) = std::env::var("INBOX_PILOT_AGENT_CMD") {
            self.coordinator.agent_command = cmd.split_whitespace().map(String::from).collect();
        }
        self.coordinator.poll_interval_secs = std::env::var("INBOX_PILOT_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.coordinator.poll_interval_secs);
        self.coordinator.max_reasoning_per_cycle =
            std::env::var("INBOX_PILOT_MAX_REASONING_PER_CYCLE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.coordinator.max_reasoning_per_cycle);
        if let Ok(cmd) = std::env::var("INBOX_PILOT_NOTIFY_CMD") {
            self.health.notify_command = cmd.split_whitespace().map(String::from).collect();
        }
    }

    /// Configured schedules, or the built-in hourly content draft.
    pub fn effective_schedules(&self) -> Vec<ScheduleConfig> {
        if self.schedules.is_empty() {
            default_schedules()
        } else {
            self.schedules.clone()
        }
    }

    /// Reject values that would make a loop spin or never fire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "coordinator.poll_interval_secs".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.health.alert_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "health.alert_threshold".into(),
                message: "must be at least 1".into(),
            });
        }
        for schedule in &self.schedules {
            match (&schedule.interval_hours, &schedule.cron) {
                (None, None) => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("schedules.{}", schedule.name),
                        message: "needs interval_hours or cron".into(),
                    });
                }
                (_, Some(expr)) => {
                    if let Err(e) = crate::pipeline::schedule::next_cron_fire(expr, chrono::Utc::now())
                    {
                        return Err(ConfigError::InvalidValue {
                            key: format!("schedules.{}.cron", schedule.name),
                            message: e,
                        });
                    }
                }
                _ => {}
            }
        }
        let mut seen = std::collections::HashSet::new();
        for process in &self.supervisor.processes {
            if !seen.insert(process.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "supervisor.processes".into(),
                    message: format!("duplicate process name {}", process.name),
                });
            }
        }
        Ok(())
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root every other relative path hangs off.
    pub base_dir: PathBuf,
    /// Stage directories live here. Defaults to `<base>/AI_Employee_Vault`.
    pub vault_dir: Option<PathBuf>,
    /// Quota, alert and schedule state files. Defaults to `<base>/credentials`.
    pub state_dir: Option<PathBuf>,
    /// Log files and audit records. Defaults to `<base>/logs`.
    pub log_dir: Option<PathBuf>,
    /// Working directory of the reasoning agent.
    pub workspace_dir: Option<PathBuf>,
    /// Optional `<kind>.md` instruction template overrides.
    pub templates_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            vault_dir: None,
            state_dir: None,
            log_dir: None,
            workspace_dir: None,
            templates_dir: None,
        }
    }
}

impl PathsConfig {
    /// Resolve a configured path against the base directory.
    fn resolve(&self, configured: &Option<PathBuf>, default: &str) -> PathBuf {
        match configured {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.base_dir.join(p),
            None => self.base_dir.join(default),
        }
    }

    pub fn vault(&self) -> PathBuf {
        self.resolve(&self.vault_dir, "AI_Employee_Vault")
    }

    pub fn state(&self) -> PathBuf {
        self.resolve(&self.state_dir, "credentials")
    }

    pub fn logs(&self) -> PathBuf {
        self.resolve(&self.log_dir, "logs")
    }

    pub fn workspace(&self) -> PathBuf {
        self.resolve(&self.workspace_dir, "orchestrator_workspace")
    }

    pub fn templates(&self) -> Option<PathBuf> {
        self.templates_dir
            .as_ref()
            .map(|_| self.resolve(&self.templates_dir, "templates"))
    }

    pub fn coordinator_lock(&self) -> PathBuf {
        self.base_dir.join("coordinator.lock")
    }

    pub fn supervisor_lock(&self) -> PathBuf {
        self.base_dir.join("supervisor.lock")
    }
}

/// Poll-cycle coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Seconds slept between cycles.
    pub poll_interval_secs: u64,
    /// Reasoning dispatches allowed per cycle.
    pub max_reasoning_per_cycle: usize,
    /// Hard deadline for one reasoning agent run.
    pub reasoning_timeout_secs: u64,
    /// Program and arguments of the reasoning agent. The instruction is
    /// written to its stdin.
    pub agent_command: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            max_reasoning_per_cycle: 3,
            reasoning_timeout_secs: 120,
            agent_command: ["claude", "-p", "--allowedTools", "Read,Write,Edit"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoning_timeout_secs)
    }
}

/// Daily action limits per channel. `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub email: Option<u32>,
    pub facebook: Option<u32>,
    pub instagram: Option<u32>,
    pub x: Option<u32>,
    pub linkedin: Option<u32>,
    pub ledger: Option<u32>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            email: None,
            facebook: Some(5),
            instagram: Some(5),
            x: Some(5),
            linkedin: Some(5),
            ledger: None,
        }
    }
}

impl QuotaConfig {
    pub fn limit_for(&self, channel: Channel) -> Option<u32> {
        match channel {
            Channel::Email => self.email,
            Channel::Facebook => self.facebook,
            Channel::Instagram => self.instagram,
            Channel::X => self.x,
            Channel::LinkedIn => self.linkedin,
            Channel::Ledger => self.ledger,
        }
    }
}

/// How to reach the action executor for one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelExecutorConfig {
    /// Program and arguments. Empty means no executor is configured and
    /// every dispatch on this channel fails.
    pub command: Vec<String>,
    /// Hard deadline for one executor run. Falls back to the channel default.
    pub timeout_secs: Option<u64>,
}

/// Per-channel action executors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub email: ChannelExecutorConfig,
    pub facebook: ChannelExecutorConfig,
    pub instagram: ChannelExecutorConfig,
    pub x: ChannelExecutorConfig,
    pub linkedin: ChannelExecutorConfig,
    pub ledger: ChannelExecutorConfig,
}

impl ExecutorConfig {
    pub fn for_channel(&self, channel: Channel) -> &ChannelExecutorConfig {
        match channel {
            Channel::Email => &self.email,
            Channel::Facebook => &self.facebook,
            Channel::Instagram => &self.instagram,
            Channel::X => &self.x,
            Channel::LinkedIn => &self.linkedin,
            Channel::Ledger => &self.ledger,
        }
    }

    /// Effective executor deadline for a channel.
    pub fn timeout_for(&self, channel: Channel) -> Duration {
        let default = match channel {
            Channel::X | Channel::Facebook | Channel::Instagram => 90,
            Channel::LinkedIn => 150,
            Channel::Email | Channel::Ledger => 120,
        };
        Duration::from_secs(self.for_channel(channel).timeout_secs.unwrap_or(default))
    }
}

/// Session health alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before an alert fires.
    pub alert_threshold: u32,
    /// Minimum hours between alerts for one channel.
    pub alert_cooldown_hours: u64,
    /// Command receiving the alert text on stdin. Empty logs the alert instead.
    pub notify_command: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 2,
            alert_cooldown_hours: 24,
            notify_command: Vec::new(),
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        saturating_hours(self.alert_cooldown_hours)
    }
}

/// `hours` as a chrono duration, clamped to the largest representable span.
pub(crate) fn saturating_hours(hours: u64) -> chrono::Duration {
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .unwrap_or(chrono::Duration::MAX)
}

/// What a schedule does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAction {
    /// Ask the reasoning agent to draft an original post for approval.
    ContentDraft,
}

/// A time-based job run at the end of each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub action: ScheduleAction,
    /// Fire when this many hours have passed since the last run.
    #[serde(default)]
    pub interval_hours: Option<u64>,
    /// Or fire on a cron expression (seconds-resolution, `cron` crate syntax).
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The one schedule present when none is configured.
pub fn default_schedules() -> Vec<ScheduleConfig> {
    vec![ScheduleConfig {
        name: "linkedin_post".to_string(),
        action: ScheduleAction::ContentDraft,
        interval_hours: Some(1),
        cron: None,
        enabled: true,
    }]
}

/// One managed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub command: Vec<String>,
    /// Seconds to wait after an exit before respawning.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    /// Restarts within `rapid_window_secs` that trigger backoff.
    #[serde(default = "default_max_rapid_restarts")]
    pub max_rapid_restarts: usize,
    #[serde(default = "default_rapid_window")]
    pub rapid_window_secs: u64,
}

fn default_restart_delay() -> u64 {
    5
}

fn default_max_rapid_restarts() -> usize {
    3
}

fn default_rapid_window() -> u64 {
    120
}

/// Process supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub health_check_interval_secs: u64,
    /// Restart pause after a restart storm.
    pub backoff_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on shutdown.
    pub stop_timeout_secs: u64,
    /// Managed processes, in start order. Empty selects the built-in table.
    pub processes: Vec<ProcessConfig>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 10,
            backoff_secs: 60,
            stop_timeout_secs: 10,
            processes: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Configured processes, or the built-in deployment table.
    pub fn effective_processes(&self) -> Vec<ProcessConfig> {
        if self.processes.is_empty() {
            default_processes()
        } else {
            self.processes.clone()
        }
    }
}

fn process(name: &str, command: &[&str], delay: u64, max_rapid: usize, window: u64) -> ProcessConfig {
    ProcessConfig {
        name: name.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        restart_delay_secs: delay,
        max_rapid_restarts: max_rapid,
        rapid_window_secs: window,
    }
}

/// Six channel listeners, the coordinator and two report generators.
pub fn default_processes() -> Vec<ProcessConfig> {
    vec![
        process("gmail_watcher", &["python", "watchers/gmail_watcher.py"], 5, 5, 60),
        process("linkedin_watcher", &["python", "watchers/linkedin_watcher.py"], 15, 3, 120),
        process("x_watcher", &["python", "watchers/x_watcher.py"], 10, 3, 120),
        process("instagram_watcher", &["python", "watchers/instagram_watcher.py"], 15, 3, 120),
        process("facebook_watcher", &["python", "watchers/facebook_watcher.py"], 15, 3, 120),
        process("odoo_watcher", &["python", "watchers/odoo_watcher.py"], 30, 3, 180),
        process("coordinator", &["inbox-pilot", "coordinator"], 5, 5, 60),
        process("reporting_engine", &["python", "reporting_engine.py"], 60, 3, 300),
        process("ceo_briefing", &["python", "ceo_briefing.py"], 60, 3, 300),
    ]
}
