//! Point-in-time view of the vault, quotas and running instances.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::channels::{Channel, ChannelKind};
use crate::config::Config;
use crate::error::Error;
use crate::pipeline::QuotaTracker;
use crate::process::lock::live_holder;
use crate::vault::{Stage, TaskStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Approvals pending or approved for this channel.
    pub in_flight: usize,
    /// How many more items listeners may queue today.
    pub slots: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub stages: Vec<(Stage, usize)>,
    pub channels: Vec<ChannelStatus>,
    pub coordinator_pid: Option<u32>,
    pub supervisor_pid: Option<u32>,
}

impl StatusReport {
    pub async fn collect(config: &Config, now: DateTime<Utc>) -> Result<Self, Error> {
        let store = TaskStore::new(config.paths.vault());
        let index = store.snapshot().await?;
        let stages = Stage::ALL.into_iter().map(|s| (s, index.count(s))).collect();

        let quota = QuotaTracker::new(config.paths.state(), config.quota.clone());
        let mut channels = Vec::new();
        for channel in Channel::ALL {
            let in_flight = [Stage::PendingApproval, Stage::Approved]
                .into_iter()
                .flat_map(|stage| index.names(stage))
                .filter(|name| ChannelKind::from_approval_name(name).is_some_and(|k| k.channel() == channel))
                .count();
            channels.push(ChannelStatus {
                channel,
                limit: quota.limit(channel),
                remaining: quota.remaining(channel, now).await?,
                in_flight,
                slots: quota.pipeline_slots(channel, in_flight, now).await?,
            });
        }

        Ok(Self {
            stages,
            channels,
            coordinator_pid: live_holder(&config.paths.coordinator_lock()),
            supervisor_pid: live_holder(&config.paths.supervisor_lock()),
        })
    }
}

fn pid_or_stopped(pid: Option<u32>) -> String {
    pid.map_or_else(|| "stopped".to_string(), |p| format!("running (pid {p})"))
}

fn or_unlimited(n: Option<u32>) -> String {
    n.map_or_else(|| "unlimited".to_string(), |n| n.to_string())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "coordinator: {}", pid_or_stopped(self.coordinator_pid))?;
        writeln!(f, "supervisor:  {}", pid_or_stopped(self.supervisor_pid))?;
        writeln!(f)?;
        for (stage, count) in &self.stages {
            writeln!(f, "{:<18} {count}", stage.dir_name())?;
        }
        writeln!(f)?;
        writeln!(f, "{:<10} {:>10} {:>10} {:>10} {:>10}", "channel", "limit", "remaining", "in flight", "slots")?;
        for c in &self.channels {
            writeln!(
                f,
                "{:<10} {:>10} {:>10} {:>10} {:>10}",
                c.channel.as_str(),
                or_unlimited(c.limit),
                or_unlimited(c.remaining),
                c.in_flight,
                or_unlimited(c.slots),
            )?;
        }
        Ok(())
    }
}
