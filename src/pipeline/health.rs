//! Session health monitor.
//!
//! Consecutive executor failures on a channel usually mean its login session
//! expired. After `threshold` failures in a row an operator alert goes out,
//! at most once per channel per cooldown. The cooldown survives restarts via
//! `<state_dir>/.<channel>_session_alert.json`; the failure counts do not.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::state::{deserialize_timestamp, load_record, save_record};
use crate::channels::Channel;
use crate::error::{NotifyError, StateError};
use crate::process::{CommandSpec, run_with_deadline};
use crate::shutdown::Shutdown;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// An alert about a channel whose session looks broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub channel: Channel,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn message(&self) -> String {
        format!(
            "inbox-pilot: {} has failed {} times in a row (last at {}). \
             The session has probably expired; log in again to resume.",
            self.channel,
            self.consecutive_failures,
            self.at.format("%Y-%m-%d %H:%M UTC"),
        )
    }
}

/// Delivery of operator alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Writes the alert to the log. Never fails.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        error!(
            channel = %alert.channel,
            consecutive_failures = alert.consecutive_failures,
            "{}",
            alert.message()
        );
        Ok(())
    }
}

/// Pipes the alert text to an external command.
pub struct CommandNotifier {
    command: CommandSpec,
    shutdown: Shutdown,
}

impl CommandNotifier {
    pub fn new(command: CommandSpec, shutdown: Shutdown) -> Self {
        Self { command, shutdown }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let output = run_with_deadline(
            &self.command,
            Some(&alert.message()),
            NOTIFY_TIMEOUT,
            &self.shutdown,
        )
        .await?;
        if output.success() {
            Ok(())
        } else {
            Err(NotifyError::Failed {
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct AlertRecord {
    #[serde(deserialize_with = "deserialize_timestamp")]
    last_alert_time: DateTime<Utc>,
}

/// Per-channel consecutive-failure tracking with rate-limited alerts.
pub struct SessionHealthMonitor {
    state_dir: PathBuf,
    threshold: u32,
    cooldown: chrono::Duration,
    failures: HashMap<Channel, u32>,
    notifier: Arc<dyn Notifier>,
}

impl SessionHealthMonitor {
    pub fn new(
        state_dir: impl Into<PathBuf>,
        threshold: u32,
        cooldown: chrono::Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            state_dir: state_dir.into(),
            threshold: threshold.max(1),
            cooldown,
            failures: HashMap::new(),
            notifier,
        }
    }

    pub fn alert_path(&self, channel: Channel) -> PathBuf {
        self.state_dir
            .join(format!(".{}_session_alert.json", channel.as_str()))
    }

    pub fn consecutive_failures(&self, channel: Channel) -> u32 {
        self.failures.get(&channel).copied().unwrap_or(0)
    }

    pub fn record_success(&mut self, channel: Channel) {
        if self.failures.remove(&channel).is_some_and(|n| n > 0) {
            info!(channel = %channel, "Channel recovered, failure count reset");
        }
    }

    /// Count a failure. Returns whether an alert was delivered.
    pub async fn record_failure(&mut self, channel: Channel, now: DateTime<Utc>) -> Result<bool, StateError> {
        let count = {
            let entry = self.failures.entry(channel).or_insert(0);
            *entry += 1;
            *entry
        };
        warn!(channel = %channel, consecutive_failures = count, "Channel action failed");

        if count < self.threshold {
            return Ok(false);
        }

        let path = self.alert_path(channel);
        let last = match load_record::<AlertRecord>(&path).await {
            Ok(record) => record.map(|r| r.last_alert_time),
            Err(StateError::Json(e)) => {
                warn!(channel = %channel, error = %e, "Corrupt alert state, treating as never alerted");
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(last) = last {
            if now - last < self.cooldown {
                debug!(channel = %channel, last_alert = %last, "Alert suppressed by cooldown");
                return Ok(false);
            }
        }

        let alert = Alert {
            channel,
            consecutive_failures: count,
            at: now,
        };
        match self.notifier.notify(&alert).await {
            Ok(()) => {
                save_record(&path, &AlertRecord { last_alert_time: now }).await?;
                info!(channel = %channel, "Session alert sent");
                Ok(true)
            }
            Err(e) => {
                // Not recorded, so the next failure tries again.
                error!(channel = %channel, error = %e, "Failed to deliver session alert");
                Ok(false)
            }
        }
    }
}
