//! Per-channel rolling daily action budget.
//!
//! Each channel's counter lives in `<state_dir>/.<channel>_daily_actions.json`
//! as `{"actions_today": n, "window_start_time": ts}`. The window expires
//! lazily: the first read at least 24 hours after `window_start_time` resets
//! the counter and persists the reset.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::state::{deserialize_timestamp, load_record, save_record};
use crate::channels::Channel;
use crate::config::QuotaConfig;
use crate::error::StateError;

/// Length of one quota window.
pub const QUOTA_WINDOW_HOURS: i64 = 24;

/// Persisted counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub actions_today: u32,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub window_start_time: DateTime<Utc>,
}

impl QuotaCounter {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            actions_today: 0,
            window_start_time: now,
        }
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.window_start_time >= Duration::hours(QUOTA_WINDOW_HOURS)
    }
}

/// Quota tracker over every channel.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    state_dir: PathBuf,
    limits: QuotaConfig,
}

impl QuotaTracker {
    pub fn new(state_dir: impl Into<PathBuf>, limits: QuotaConfig) -> Self {
        Self {
            state_dir: state_dir.into(),
            limits,
        }
    }

    /// Daily limit, `None` if the channel is unlimited.
    pub fn limit(&self, channel: Channel) -> Option<u32> {
        self.limits.limit_for(channel)
    }

    pub fn path(&self, channel: Channel) -> PathBuf {
        self.state_dir.join(format!(".{}_daily_actions.json", channel.as_str()))
    }

    /// Current counter, applying (and persisting) an expired window reset.
    /// A corrupt file counts as a fresh window.
    pub async fn counter(&self, channel: Channel, now: DateTime<Utc>) -> Result<QuotaCounter, StateError> {
        let path = self.path(channel);
        let stored = match load_record::<QuotaCounter>(&path).await {
            Ok(stored) => stored,
            Err(StateError::Json(e)) => {
                warn!(channel = %channel, error = %e, "Corrupt quota file, starting a fresh window");
                let fresh = QuotaCounter::fresh(now);
                save_record(&path, &fresh).await?;
                return Ok(fresh);
            }
            Err(e) => return Err(e),
        };

        match stored {
            None => Ok(QuotaCounter::fresh(now)),
            Some(counter) if counter.expired(now) => {
                info!(
                    channel = %channel,
                    previous = counter.actions_today,
                    "Quota window expired, resetting"
                );
                let fresh = QuotaCounter::fresh(now);
                save_record(&path, &fresh).await?;
                Ok(fresh)
            }
            Some(counter) => Ok(counter),
        }
    }

    /// Actions left in the current window. `None` means unlimited.
    pub async fn remaining(&self, channel: Channel, now: DateTime<Utc>) -> Result<Option<u32>, StateError> {
        let Some(limit) = self.limit(channel) else {
            return Ok(None);
        };
        let counter = self.counter(channel, now).await?;
        Ok(Some(limit.saturating_sub(counter.actions_today)))
    }

    /// Count one executed action. Returns the new count.
    pub async fn record(&self, channel: Channel, now: DateTime<Utc>) -> Result<u32, StateError> {
        let mut counter = self.counter(channel, now).await?;
        counter.actions_today = counter.actions_today.saturating_add(1);
        save_record(&self.path(channel), &counter).await?;
        info!(
            channel = %channel,
            count = counter.actions_today,
            limit = ?self.limit(channel),
            "Recorded action against daily quota"
        );
        Ok(counter.actions_today)
    }

    /// How many more items a listener may queue without overrunning the
    /// budget: remaining minus approvals already in flight.
    pub async fn pipeline_slots(
        &self,
        channel: Channel,
        in_flight: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, StateError> {
        let in_flight = u32::try_from(in_flight).unwrap_or(u32::MAX);
        Ok(self
            .remaining(channel, now)
            .await?
            .map(|remaining| remaining.saturating_sub(in_flight)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker(dir: &TempDir) -> QuotaTracker {
        QuotaTracker::new(dir.path(), QuotaConfig::default())
    }

    #[tokio::test]
    async fn fresh_channel_has_full_budget() {
        let dir = TempDir::new().unwrap();
        let quota = tracker(&dir);
        assert_eq!(quota.remaining(Channel::X, Utc::now()).await.unwrap(), Some(5));
        assert_eq!(quota.remaining(Channel::Email, Utc::now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remaining_never_negative() {
        let dir = TempDir::new().unwrap();
        let quota = tracker(&dir);
        let now = Utc::now();
        for expected in (0..5).rev() {
            quota.record(Channel::LinkedIn, now).await.unwrap();
            assert_eq!(quota.remaining(Channel::LinkedIn, now).await.unwrap(), Some(expected));
        }
        quota.record(Channel::LinkedIn, now).await.unwrap();
        assert_eq!(quota.remaining(Channel::LinkedIn, now).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn window_resets_once_after_24h() {
        let dir = TempDir::new().unwrap();
        let quota = tracker(&dir);
        let start = Utc::now() - Duration::hours(30);
        for _ in 0..5 {
            quota.record(Channel::X, start).await.unwrap();
        }
        assert_eq!(quota.remaining(Channel::X, start + Duration::hours(23)).await.unwrap(), Some(0));

        let later = start + Duration::hours(24);
        assert_eq!(quota.remaining(Channel::X, later).await.unwrap(), Some(5));
        // the reset was persisted with the new window start
        let counter = quota.counter(Channel::X, later + Duration::hours(1)).await.unwrap();
        assert_eq!(counter.window_start_time, later);

        quota.record(Channel::X, later + Duration::hours(1)).await.unwrap();
        assert_eq!(quota.remaining(Channel::X, later + Duration::hours(2)).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn reads_legacy_file_format() {
        let dir = TempDir::new().unwrap();
        let quota = tracker(&dir);
        let start = Utc::now() - Duration::hours(1);
        let legacy = format!(
            r#"{{"actions_today": 3, "window_start_time": "{}"}}"#,
            start.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f")
        );
        std::fs::write(quota.path(Channel::X), legacy).unwrap();
        assert_eq!(quota.remaining(Channel::X, Utc::now()).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn corrupt_file_counts_as_fresh() {
        let dir = TempDir::new().unwrap();
        let quota = tracker(&dir);
        std::fs::write(quota.path(Channel::X), "{not json").unwrap();
        assert_eq!(quota.remaining(Channel::X, Utc::now()).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn pipeline_slots_subtract_in_flight() {
        let dir = TempDir::new().unwrap();
        let quota = tracker(&dir);
        let now = Utc::now();
        quota.record(Channel::Facebook, now).await.unwrap();
        assert_eq!(quota.pipeline_slots(Channel::Facebook, 2, now).await.unwrap(), Some(2));
        assert_eq!(quota.pipeline_slots(Channel::Facebook, 9, now).await.unwrap(), Some(0));
        assert_eq!(quota.pipeline_slots(Channel::Email, 9, now).await.unwrap(), None);
    }
}
