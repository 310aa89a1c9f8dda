//! Run repository.
//!
//! Owns the specialised queries of the run engine: atomic claiming of due
//! pending runs, stale-RUNNING discovery, retry rescheduling.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{Run, RunCounts, RunState};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Progress message written when a pending run is cancelled.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Run repository trait.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn get_run(&self, id: &str) -> Result<Run>;
    async fn create_run(&self, run: &Run) -> Result<()>;

    /// Claim up to `max` due pending runs: within one transaction, select
    /// rows with state PENDING and `scheduled_at <= now` ordered by
    /// `scheduled_at` ascending and flip them to RUNNING with
    /// `started_at = now`. Returns the claimed rows in claim order.
    async fn claim_pending_runs(&self, now: i64, max: u32) -> Result<Vec<Run>>;

    /// RUNNING runs whose `started_at` is at or before `threshold`.
    async fn find_stale_running(&self, threshold: i64) -> Result<Vec<Run>>;

    /// Every RUNNING run; used once at process start to reap leftovers.
    async fn find_all_running(&self) -> Result<Vec<Run>>;

    /// Update the last-written progress snapshot for a run.
    async fn update_progress(&self, id: &str, current: i64, total: i64, message: &str)
        -> Result<()>;

    /// RUNNING → COMPLETED with output and final progress.
    async fn complete_run(
        &self,
        id: &str,
        output: &str,
        current: i64,
        total: i64,
        message: &str,
    ) -> Result<()>;

    /// {PENDING, RUNNING} → FAILED with an error message.
    async fn fail_run(&self, id: &str, error: &str) -> Result<()>;

    /// RUNNING → PENDING for retry: increment `retry_count`, record the
    /// error, advance `scheduled_at`.
    async fn reschedule_run(&self, id: &str, error: &str, scheduled_at: i64) -> Result<()>;

    /// PENDING → CANCELLED. Any other state is an invalid transition.
    async fn cancel_pending_run(&self, id: &str) -> Result<()>;

    async fn list_recent_runs(&self, limit: u32) -> Result<Vec<Run>>;
    async fn count_runs_by_state(&self) -> Result<RunCounts>;

    /// Delete terminal runs older than `days`. Returns the number removed.
    async fn purge_runs_older_than(&self, days: u32) -> Result<u64>;
}

/// SQLx implementation of [`RunRepository`].
pub struct SqlxRunRepository {
    pool: SqlitePool,
}

impl SqlxRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for SqlxRunRepository {
    async fn get_run(&self, id: &str) -> Result<Run> {
        sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Run", id))
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        retry_on_sqlite_busy("create_run", || async {
            sqlx::query(
                r#"
                INSERT INTO runs (
                    id, source_id, schedule_id, name, state, input, output, error,
                    progress_current, progress_total, progress_message,
                    retry_count, max_retries, scheduled_at, started_at, completed_at,
                    created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&run.id)
            .bind(&run.source_id)
            .bind(&run.schedule_id)
            .bind(&run.name)
            .bind(&run.state)
            .bind(&run.input)
            .bind(&run.output)
            .bind(&run.error)
            .bind(run.progress_current)
            .bind(run.progress_total)
            .bind(&run.progress_message)
            .bind(run.retry_count)
            .bind(run.max_retries)
            .bind(run.scheduled_at)
            .bind(run.started_at)
            .bind(run.completed_at)
            .bind(run.created_at)
            .bind(run.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn claim_pending_runs(&self, now: i64, max: u32) -> Result<Vec<Run>> {
        retry_on_sqlite_busy("claim_pending_runs", || async {
            let mut tx = self.pool.begin().await?;

            let mut runs = sqlx::query_as::<_, Run>(
                r#"
                SELECT * FROM runs
                WHERE state = 'PENDING' AND scheduled_at <= ?
                ORDER BY scheduled_at ASC
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(max)
            .fetch_all(&mut *tx)
            .await?;

            for run in &mut runs {
                sqlx::query(
                    r#"
                    UPDATE runs
                    SET state = 'RUNNING', started_at = ?, updated_at = ?
                    WHERE id = ? AND state = 'PENDING'
                    "#,
                )
                .bind(now)
                .bind(now)
                .bind(&run.id)
                .execute(&mut *tx)
                .await?;

                run.state = RunState::Running.as_str().to_string();
                run.started_at = Some(now);
                run.updated_at = now;
            }

            tx.commit().await?;
            Ok(runs)
        })
        .await
    }

    async fn find_stale_running(&self, threshold: i64) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            "SELECT * FROM runs WHERE state = 'RUNNING' AND started_at <= ? ORDER BY started_at",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    async fn find_all_running(&self) -> Result<Vec<Run>> {
        let runs =
            sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE state = 'RUNNING' ORDER BY started_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(runs)
    }

    async fn update_progress(
        &self,
        id: &str,
        current: i64,
        total: i64,
        message: &str,
    ) -> Result<()> {
        retry_on_sqlite_busy("update_run_progress", || async {
            sqlx::query(
                r#"
                UPDATE runs
                SET progress_current = ?, progress_total = ?, progress_message = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(current)
            .bind(total)
            .bind(message)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn complete_run(
        &self,
        id: &str,
        output: &str,
        current: i64,
        total: i64,
        message: &str,
    ) -> Result<()> {
        retry_on_sqlite_busy("complete_run", || async {
            let now = now_ms();
            let res = sqlx::query(
                r#"
                UPDATE runs
                SET state = 'COMPLETED', output = ?, error = NULL,
                    progress_current = ?, progress_total = ?, progress_message = ?,
                    completed_at = ?, updated_at = ?
                WHERE id = ? AND state = 'RUNNING'
                "#,
            )
            .bind(output)
            .bind(current)
            .bind(total)
            .bind(message)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() == 0 {
                return Err(self.invalid_transition(id, RunState::Completed).await);
            }
            Ok(())
        })
        .await
    }

    async fn fail_run(&self, id: &str, error: &str) -> Result<()> {
        retry_on_sqlite_busy("fail_run", || async {
            let now = now_ms();
            let res = sqlx::query(
                r#"
                UPDATE runs
                SET state = 'FAILED', error = ?, completed_at = ?, updated_at = ?
                WHERE id = ? AND state IN ('PENDING', 'RUNNING')
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() == 0 {
                return Err(self.invalid_transition(id, RunState::Failed).await);
            }
            Ok(())
        })
        .await
    }

    async fn reschedule_run(&self, id: &str, error: &str, scheduled_at: i64) -> Result<()> {
        retry_on_sqlite_busy("reschedule_run", || async {
            let res = sqlx::query(
                r#"
                UPDATE runs
                SET state = 'PENDING', retry_count = retry_count + 1, error = ?,
                    scheduled_at = ?, started_at = NULL, updated_at = ?
                WHERE id = ? AND state = 'RUNNING'
                "#,
            )
            .bind(error)
            .bind(scheduled_at)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() == 0 {
                return Err(self.invalid_transition(id, RunState::Pending).await);
            }
            Ok(())
        })
        .await
    }

    async fn cancel_pending_run(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("cancel_pending_run", || async {
            let now = now_ms();
            let res = sqlx::query(
                r#"
                UPDATE runs
                SET state = 'CANCELLED', progress_message = ?, completed_at = ?, updated_at = ?
                WHERE id = ? AND state = 'PENDING'
                "#,
            )
            .bind(CANCELLED_BY_USER)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() == 0 {
                return Err(self.invalid_transition(id, RunState::Cancelled).await);
            }
            Ok(())
        })
        .await
    }

    async fn list_recent_runs(&self, limit: u32) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>("SELECT * FROM runs ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(runs)
    }

    async fn count_runs_by_state(&self) -> Result<RunCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM runs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = RunCounts::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            match RunState::parse(&state) {
                Some(RunState::Pending) => counts.pending = count,
                Some(RunState::Running) => counts.running = count,
                Some(RunState::Completed) => counts.completed = count,
                Some(RunState::Failed) => counts.failed = count,
                Some(RunState::Cancelled) => counts.cancelled = count,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn purge_runs_older_than(&self, days: u32) -> Result<u64> {
        retry_on_sqlite_busy("purge_runs_older_than", || async {
            let cutoff = now_ms() - i64::from(days) * 24 * 60 * 60 * 1000;
            let res = sqlx::query(
                r#"
                DELETE FROM runs
                WHERE state IN ('COMPLETED', 'FAILED', 'CANCELLED') AND created_at < ?
                "#,
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok(res.rows_affected())
        })
        .await
    }
}

impl SqlxRunRepository {
    /// Build the error for a conditional update that matched no row: either
    /// the run is missing or it was in a state the transition forbids.
    async fn invalid_transition(&self, id: &str, to: RunState) -> Error {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

        match state {
            None => Error::not_found("Run", id),
            Some(from) => Error::InvalidStateTransition {
                from,
                to: to.as_str().to_string(),
            },
        }
    }
}
