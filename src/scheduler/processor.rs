//! Run processor: claims due pending runs, executes them, applies the
//! retry/backoff policy and reclaims orphaned RUNNING rows.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::database::models::{Run, FETCH_SOURCE_JOB};
use crate::database::repositories::RunRepository;
use crate::database::time::now_ms;
use crate::runner::SourceRunner;
use crate::Result;

/// Error recorded when stale recovery reaps a run.
pub const TIMED_OUT: &str = "timed out";

/// Error recorded when startup recovery reaps a run.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by server restart";

/// Progress message written when execution begins.
pub const STARTING: &str = "Starting…";

/// The run processor. One instance per process; ticks are serialized
/// internally so a manual trigger can never overlap the poll-driven tick.
pub struct RunProcessor {
    runs: Arc<dyn RunRepository>,
    runner: Arc<SourceRunner>,
    config: SchedulerConfig,
    /// Root of every run's cancellation scope.
    cancel: CancellationToken,
    tick_lock: Mutex<()>,
}

impl RunProcessor {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        runner: Arc<SourceRunner>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runs,
            runner,
            config,
            cancel,
            tick_lock: Mutex::new(()),
        }
    }

    /// One cooperative tick: reclaim stale RUNNING rows, then claim and
    /// execute due pending runs sequentially.
    pub async fn tick(&self) -> Result<()> {
        let _guard = self.tick_lock.lock().await;

        self.recover_stale().await?;

        let now = now_ms();
        let claimed = self
            .runs
            .claim_pending_runs(now, self.config.max_runs_per_poll)
            .await?;

        if claimed.is_empty() {
            return Ok(());
        }

        info!(count = claimed.len(), "Claimed due runs");
        for run in claimed {
            if self.cancel.is_cancelled() {
                break;
            }
            self.execute_run(run).await;
        }
        Ok(())
    }

    /// External nudge for "run now": the same tick, without waiting for the
    /// poll cron.
    pub async fn trigger_processing(&self) -> Result<()> {
        self.tick().await
    }

    /// Reclaim RUNNING rows whose lease expired.
    async fn recover_stale(&self) -> Result<()> {
        let threshold = now_ms() - self.config.stale_run_timeout_ms;
        let stale = self.runs.find_stale_running(threshold).await?;
        for run in stale {
            warn!(run_id = %run.id, "Reclaiming stale run");
            self.retry_or_fail(&run, TIMED_OUT, None).await;
        }
        Ok(())
    }

    /// At process start every RUNNING row is orphaned by definition; put it
    /// back in the queue (due immediately) or fail it.
    pub async fn recover_runs_on_startup(&self) -> Result<()> {
        let orphaned = self.runs.find_all_running().await?;
        if orphaned.is_empty() {
            return Ok(());
        }

        info!(count = orphaned.len(), "Recovering runs left RUNNING by a previous process");
        for run in orphaned {
            self.retry_or_fail(&run, INTERRUPTED_BY_RESTART, Some(now_ms()))
                .await;
        }
        Ok(())
    }

    /// Execute one claimed run to a terminal or retried state.
    async fn execute_run(&self, run: Run) {
        if let Err(e) = self.runs.update_progress(&run.id, 0, 0, STARTING).await {
            warn!(run_id = %run.id, error = %e, "Could not write starting progress");
        }

        if run.name != FETCH_SOURCE_JOB {
            let message = format!("unknown job kind '{}'", run.name);
            self.fail(&run.id, &message).await;
            return;
        }

        let Some(source_id) = run.source_id.clone() else {
            self.fail(&run.id, "run has no source").await;
            return;
        };

        let scope = self.cancel.child_token();
        match self.runner.run(&run.id, &source_id, &scope).await {
            Ok(report) if report.success => {
                let result = self
                    .runs
                    .complete_run(
                        &run.id,
                        &report.to_output_json(),
                        report.images_downloaded as i64,
                        report.images_found as i64,
                        &report.final_message(),
                    )
                    .await;
                if let Err(e) = result {
                    error!(run_id = %run.id, error = %e, "Could not mark run completed");
                }
            }
            Ok(report) => {
                let message = report
                    .skip_reason
                    .unwrap_or_else(|| "run reported failure".to_string());
                self.fail(&run.id, &message).await;
            }
            Err(e) if e.is_transient() => {
                self.retry_or_fail(&run, &e.to_string(), None).await;
            }
            Err(e) => {
                self.fail(&run.id, &e.to_string()).await;
            }
        }
    }

    /// Apply the retry rule to a RUNNING run: back into the queue while the
    /// budget lasts, FAILED once it is spent. `scheduled_at` overrides the
    /// backoff (startup recovery retries immediately).
    async fn retry_or_fail(&self, run: &Run, error: &str, scheduled_at: Option<i64>) {
        if run.can_retry() {
            let due = scheduled_at.unwrap_or_else(|| {
                now_ms() + run.next_retry_delay_ms(self.config.retry_backoff_base_ms)
            });
            match self.runs.reschedule_run(&run.id, error, due).await {
                Ok(()) => info!(
                    run_id = %run.id,
                    retry = run.retry_count + 1,
                    max_retries = run.max_retries,
                    "Run rescheduled for retry"
                ),
                Err(e) => error!(run_id = %run.id, error = %e, "Could not reschedule run"),
            }
        } else {
            self.fail(&run.id, error).await;
        }
    }

    async fn fail(&self, run_id: &str, message: &str) {
        warn!(run_id = %run_id, error = %message, "Run failed");
        if let Err(e) = self.runs.fail_run(run_id, message).await {
            error!(run_id = %run_id, error = %e, "Could not mark run failed");
        }
    }

    /// Root cancellation token for every run scope.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
