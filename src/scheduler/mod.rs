//! Cron scheduler: one timer task per schedule row inserting pending runs at
//! fire times, plus the poll-cron driver that ticks the run processor.
//!
//! The scheduler is a singleton within the process; a second `start` on the
//! same instance is rejected. Timer tasks only ever insert run rows —
//! execution always goes through the run processor.

pub mod processor;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::models::Run;
use crate::database::repositories::{RunRepository, ScheduleRepository, SourceRepository};
use crate::{Error, Result};

pub use processor::{RunProcessor, INTERRUPTED_BY_RESTART, STARTING, TIMED_OUT};

struct ScheduleTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The cron scheduler.
pub struct CronScheduler {
    schedules: Arc<dyn ScheduleRepository>,
    sources: Arc<dyn SourceRepository>,
    runs: Arc<dyn RunRepository>,
    processor: Arc<RunProcessor>,
    poll_cron: String,
    cancel: CancellationToken,
    timers: Mutex<HashMap<String, ScheduleTimer>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CronScheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        sources: Arc<dyn SourceRepository>,
        runs: Arc<dyn RunRepository>,
        processor: Arc<RunProcessor>,
        poll_cron: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            schedules,
            sources,
            runs,
            processor,
            poll_cron,
            cancel,
            timers: Mutex::new(HashMap::new()),
            poll_handle: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Recover orphaned runs, load schedule timers and start the poll-cron
    /// driver. May be called once per instance.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::config("scheduler already started"));
        }

        self.processor.recover_runs_on_startup().await?;
        self.load_schedules().await?;
        self.start_poll_driver()?;

        info!("Scheduler started");
        Ok(())
    }

    /// One store read of all schedules joined with their source; disabled
    /// sources are skipped, every remaining row gets a timer.
    pub async fn load_schedules(&self) -> Result<()> {
        let rows = self.schedules.list_schedules_with_source().await?;
        let mut loaded = 0usize;

        let mut timers = self.timers.lock();
        for row in rows {
            if !row.source_enabled {
                debug!(schedule_id = %row.id, "Skipping schedule of disabled source");
                continue;
            }

            let schedule = match cron::Schedule::from_str(&row.cron_expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(
                        schedule_id = %row.id,
                        expression = %row.cron_expression,
                        error = %e,
                        "Skipping schedule with unparseable cron expression"
                    );
                    continue;
                }
            };

            let cancel = self.cancel.child_token();
            let handle = tokio::spawn(schedule_loop(
                row.id.clone(),
                row.source_id.clone(),
                schedule,
                Arc::clone(&self.sources),
                Arc::clone(&self.runs),
                cancel.clone(),
            ));
            timers.insert(row.id, ScheduleTimer { cancel, handle });
            loaded += 1;
        }

        info!(count = loaded, "Schedules loaded");
        Ok(())
    }

    /// Stop all timers and re-run `load_schedules`. Invoked by the admin
    /// surface after any mutation that affects schedules or source enablement.
    pub async fn reload_schedules(&self) -> Result<()> {
        let old: Vec<ScheduleTimer> = {
            let mut timers = self.timers.lock();
            timers.drain().map(|(_, timer)| timer).collect()
        };
        for timer in old {
            timer.cancel.cancel();
            timer.handle.abort();
        }

        self.load_schedules().await
    }

    /// Cancel every timer, the poll driver and all run scopes.
    pub fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.cancel.cancel();

        let mut timers = self.timers.lock();
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        if let Some(handle) = self.poll_handle.lock().take() {
            handle.abort();
        }
    }

    /// Drive `RunProcessor::tick` from the scheduler's own poll cron.
    fn start_poll_driver(&self) -> Result<()> {
        let poll = cron::Schedule::from_str(&self.poll_cron).map_err(|e| {
            Error::config(format!("invalid poll cron '{}': {}", self.poll_cron, e))
        })?;

        let processor = Arc::clone(&self.processor);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = poll.after(&Utc::now()).next() else {
                    return;
                };
                let wait = match (next - Utc::now()).to_std() {
                    Ok(wait) => wait,
                    Err(_) => continue,
                };

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }

                // A failing tick (store down) is logged; the next fire
                // tries again.
                if let Err(e) = processor.tick().await {
                    error!(error = %e, "Run processor tick failed");
                }
            }
        });

        *self.poll_handle.lock() = Some(handle);
        Ok(())
    }

    /// The run processor behind this scheduler.
    pub fn processor(&self) -> &Arc<RunProcessor> {
        &self.processor
    }
}

/// Timer loop for one schedule: sleep to the next fire time, re-verify the
/// source, insert a pending run.
async fn schedule_loop(
    schedule_id: String,
    source_id: String,
    schedule: cron::Schedule,
    sources: Arc<dyn SourceRepository>,
    runs: Arc<dyn RunRepository>,
    cancel: CancellationToken,
) {
    loop {
        let Some(next) = schedule.after(&Utc::now()).next() else {
            debug!(schedule_id = %schedule_id, "Cron schedule has no future fire times");
            return;
        };

        let wait = match (next - Utc::now()).to_std() {
            Ok(wait) => wait,
            Err(_) => continue,
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = fire_schedule(&schedule_id, &source_id, &sources, &runs).await {
            error!(schedule_id = %schedule_id, error = %e, "Schedule fire failed");
        }
    }
}

/// Insert one pending run for a fire, re-reading the source first (no cached
/// enablement).
async fn fire_schedule(
    schedule_id: &str,
    source_id: &str,
    sources: &Arc<dyn SourceRepository>,
    runs: &Arc<dyn RunRepository>,
) -> Result<()> {
    let source = match sources.get_source(source_id).await {
        Ok(source) => source,
        Err(Error::NotFound { .. }) => {
            warn!(schedule_id = %schedule_id, "Source vanished; schedule fire dropped");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if !source.enabled {
        debug!(schedule_id = %schedule_id, "Source disabled; schedule fire dropped");
        return Ok(());
    }

    let run = Run::fetch_source(&source.id).with_schedule(schedule_id);
    runs.create_run(&run).await?;
    info!(schedule_id = %schedule_id, run_id = %run.id, source = %source.name, "Scheduled run created");
    Ok(())
}
