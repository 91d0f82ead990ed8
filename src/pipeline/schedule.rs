//! Time-based jobs run at the end of each coordinator cycle.
//!
//! Each schedule keeps its last run in `<state_dir>/.<name>_last_run.json`,
//! so a restart neither double-fires nor forgets a due job.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::reasoning::{ReasoningDispatcher, ReasoningOutcome};
use super::state::{deserialize_timestamp, load_record, save_record};
use crate::channels::ChannelKind;
use crate::config::{ScheduleAction, ScheduleConfig, saturating_hours};
use crate::error::{Error, StateError};
use crate::vault::timestamp;

/// Parse a cron expression and compute the next fire time after `after`.
pub fn next_cron_fire(schedule: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(cron_schedule.after(&after).next())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct LastRun {
    #[serde(deserialize_with = "deserialize_timestamp")]
    last_scheduled_at: DateTime<Utc>,
}

/// Persisted last-run timestamps.
#[derive(Debug, Clone)]
pub struct ScheduleBook {
    state_dir: PathBuf,
}

impl ScheduleBook {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!(".{name}_last_run.json"))
    }

    /// Last run, `None` if never run. A corrupt record counts as never run.
    pub async fn last_run(&self, name: &str) -> Result<Option<DateTime<Utc>>, StateError> {
        match load_record::<LastRun>(&self.path(name)).await {
            Ok(record) => Ok(record.map(|r| r.last_scheduled_at)),
            Err(StateError::Json(e)) => {
                warn!(schedule = name, error = %e, "Corrupt schedule state, treating as never run");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn mark_run(&self, name: &str, now: DateTime<Utc>) -> Result<(), StateError> {
        save_record(&self.path(name), &LastRun { last_scheduled_at: now }).await
    }
}

/// Whether a schedule should fire now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Due {
    Now,
    NotYet,
    /// A cron schedule that has never run: record `now` as the starting
    /// point instead of firing immediately.
    Baseline,
}

pub fn is_due(schedule: &ScheduleConfig, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Due {
    if let Some(expr) = &schedule.cron {
        let Some(last) = last else {
            return Due::Baseline;
        };
        return match next_cron_fire(expr, last) {
            Ok(Some(next)) if next <= now => Due::Now,
            Ok(_) => Due::NotYet,
            Err(e) => {
                warn!(schedule = %schedule.name, error = %e, "Skipping schedule with invalid cron");
                Due::NotYet
            }
        };
    }

    match (schedule.interval_hours, last) {
        (Some(_), None) => Due::Now,
        (Some(hours), Some(last)) => {
            if now - last >= saturating_hours(hours) {
                Due::Now
            } else {
                Due::NotYet
            }
        }
        (None, _) => Due::NotYet,
    }
}

/// Runs due schedules.
pub struct Scheduler {
    schedules: Vec<ScheduleConfig>,
    book: ScheduleBook,
}

impl Scheduler {
    pub fn new(schedules: Vec<ScheduleConfig>, book: ScheduleBook) -> Self {
        Self { schedules, book }
    }

    pub fn book(&self) -> &ScheduleBook {
        &self.book
    }

    /// Fire every due schedule. Returns the names that fired.
    ///
    /// A schedule is marked as run whatever the job's outcome, so a failing
    /// agent is retried on the next interval rather than every cycle. A
    /// missing agent executable is returned as an error.
    pub async fn run_due(&self, dispatcher: &ReasoningDispatcher, now: DateTime<Utc>) -> Result<Vec<String>, Error> {
        let mut fired = Vec::new();
        for schedule in self.schedules.iter().filter(|s| s.enabled) {
            let last = self.book.last_run(&schedule.name).await?;
            match is_due(schedule, last, now) {
                Due::NotYet => {
                    debug!(schedule = %schedule.name, "Schedule not due");
                    continue;
                }
                Due::Baseline => {
                    info!(schedule = %schedule.name, "First sighting of cron schedule, recording baseline");
                    self.book.mark_run(&schedule.name, now).await?;
                    continue;
                }
                Due::Now => {}
            }

            match schedule.action {
                ScheduleAction::ContentDraft => {
                    let name = format!(
                        "{}{}.md",
                        ChannelKind::ContentDraft.approval_prefix(),
                        timestamp(now)
                    );
                    info!(schedule = %schedule.name, approval = %name, "Requesting content draft");
                    let outcome = dispatcher.draft_content(&name).await?;
                    if !matches!(outcome, ReasoningOutcome::Completed { .. }) {
                        warn!(schedule = %schedule.name, ?outcome, "Content draft did not complete");
                    }
                }
            }

            self.book.mark_run(&schedule.name, now).await?;
            fired.push(schedule.name.clone());
        }
        Ok(fired)
    }
}
