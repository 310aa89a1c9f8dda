//! Run database model.
//!
//! A run is one execution attempt of a job, normally a source fetch. States
//! move PENDING → RUNNING → {COMPLETED | FAILED}; PENDING may instead go to
//! CANCELLED; a retry resets RUNNING → PENDING with an advanced
//! `scheduled_at`. A RUNNING row only exists while the owning process is
//! alive — any RUNNING row seen at startup belongs to a crashed owner.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Job kind of a source-fetch run.
pub const FETCH_SOURCE_JOB: &str = "fetch_source";

/// Run state values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Queued and waiting to be claimed.
    Pending,
    /// Claimed by the run processor of the current process.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed after exhausting retries (or non-retriably).
    Failed,
    /// Cancelled by the user while still pending.
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Run counts by state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl RunCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }
}

/// Run database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub source_id: Option<String>,
    pub schedule_id: Option<String>,
    /// Job kind, e.g. [`FETCH_SOURCE_JOB`].
    pub name: String,
    /// See [`RunState`].
    pub state: String,
    /// JSON blob of job input.
    pub input: String,
    /// JSON blob of job output (per-image details for fetch runs).
    pub output: String,
    pub error: Option<String>,
    pub progress_current: i64,
    pub progress_total: i64,
    pub progress_message: String,
    pub retry_count: i64,
    pub max_retries: i64,
    /// Earliest time the run may be claimed.
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Run {
    /// Create a new pending run due immediately.
    pub fn new(name: impl Into<String>, source_id: Option<String>) -> Self {
        let now = now_ms();
        Self {
            id: super::new_id(),
            source_id,
            schedule_id: None,
            name: name.into(),
            state: RunState::Pending.as_str().to_string(),
            input: "{}".to_string(),
            output: "{}".to_string(),
            error: None,
            progress_current: 0,
            progress_total: 0,
            progress_message: String::new(),
            retry_count: 0,
            max_retries: 3,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a pending fetch run for a source.
    pub fn fetch_source(source_id: impl Into<String>) -> Self {
        Self::new(FETCH_SOURCE_JOB, Some(source_id.into()))
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    /// Get the run state as an enum.
    pub fn get_state(&self) -> Option<RunState> {
        RunState::parse(&self.state)
    }

    /// Whether this run has retry budget left.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Backoff delay applied when moving from `retry_count` to
    /// `retry_count + 1`: the first retry waits `base`, each further retry
    /// doubles it.
    pub fn next_retry_delay_ms(&self, base_ms: i64) -> i64 {
        let exponent = self.retry_count.clamp(0, 30) as u32;
        base_ms.saturating_mul(1i64 << exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_is_pending() {
        let run = Run::fetch_source("src-1");
        assert_eq!(run.get_state(), Some(RunState::Pending));
        assert_eq!(run.name, FETCH_SOURCE_JOB);
        assert_eq!(run.retry_count, 0);
        assert_eq!(run.max_retries, 3);
        assert!(run.started_at.is_none());
    }

    #[test]
    fn state_round_trip() {
        for state in [
            RunState::Pending,
            RunState::Running,
            RunState::Completed,
            RunState::Failed,
            RunState::Cancelled,
        ] {
            assert_eq!(RunState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RunState::parse("UNKNOWN"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let mut run = Run::fetch_source("src-1");
        assert_eq!(run.next_retry_delay_ms(1000), 1000);
        run.retry_count = 1;
        assert_eq!(run.next_retry_delay_ms(1000), 2000);
        run.retry_count = 2;
        assert_eq!(run.next_retry_delay_ms(1000), 4000);
    }
}
