//! Administrative surface consumed by the (external) web layer.
//!
//! CRUD on devices, sources, schedules and subscriptions with validation,
//! manual run creation, pending-run cancellation, totals and the
//! cursor-paged gallery. Mutations that affect schedules or source
//! enablement reload the scheduler's timers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::models::{
    Device, Run, RunCounts, Schedule, Source, Subscription,
};
use crate::database::repositories::{
    DeviceRepository, GalleryPage, ImageRepository, RunRepository, ScheduleRepository,
    SourceRepository, SubscriptionRepository,
};
use crate::scheduler::CronScheduler;
use crate::sources::AdapterRegistry;
use crate::{Error, Result};

/// Entity totals shown on the admin dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub devices: u64,
    pub sources: u64,
    pub images: u64,
    pub device_images: u64,
    pub runs: RunCounts,
}

/// The admin service: every operation the external web layer may invoke.
pub struct AdminService {
    devices: Arc<dyn DeviceRepository>,
    sources: Arc<dyn SourceRepository>,
    schedules: Arc<dyn ScheduleRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    runs: Arc<dyn RunRepository>,
    images: Arc<dyn ImageRepository>,
    registry: Arc<AdapterRegistry>,
    scheduler: Arc<CronScheduler>,
}

impl AdminService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        sources: Arc<dyn SourceRepository>,
        schedules: Arc<dyn ScheduleRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        runs: Arc<dyn RunRepository>,
        images: Arc<dyn ImageRepository>,
        registry: Arc<AdapterRegistry>,
        scheduler: Arc<CronScheduler>,
    ) -> Self {
        Self {
            devices,
            sources,
            schedules,
            subscriptions,
            runs,
            images,
            registry,
            scheduler,
        }
    }

    // --- Devices ---

    pub async fn create_device(&self, device: Device) -> Result<Device> {
        device.validate()?;
        self.devices.create_device(&device).await?;
        info!(device = %device.slug, "Device created");
        Ok(device)
    }

    pub async fn update_device(&self, device: Device) -> Result<Device> {
        device.validate()?;
        self.devices.update_device(&device).await?;
        Ok(device)
    }

    pub async fn delete_device(&self, id: &str) -> Result<()> {
        self.devices.delete_device(id).await
    }

    pub async fn get_device(&self, id: &str) -> Result<Device> {
        self.devices.get_device(id).await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        self.devices.list_devices().await
    }

    // --- Sources ---

    pub async fn create_source(&self, source: Source) -> Result<Source> {
        self.validate_source(&source)?;
        self.sources.create_source(&source).await?;
        info!(source = %source.name, kind = %source.kind, "Source created");
        Ok(source)
    }

    /// Update a source; enablement changes affect loaded schedule timers, so
    /// the scheduler is reloaded.
    pub async fn update_source(&self, source: Source) -> Result<Source> {
        self.validate_source(&source)?;
        self.sources.update_source(&source).await?;
        self.scheduler.reload_schedules().await?;
        Ok(source)
    }

    pub async fn delete_source(&self, id: &str) -> Result<()> {
        self.sources.delete_source(id).await?;
        self.scheduler.reload_schedules().await
    }

    pub async fn get_source(&self, id: &str) -> Result<Source> {
        self.sources.get_source(id).await
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        self.sources.list_sources().await
    }

    fn validate_source(&self, source: &Source) -> Result<()> {
        source.validate()?;
        let adapter = self.registry.resolve(&source.kind)?;
        adapter.validate_params(&source.params_json()?)
    }

    // --- Schedules ---

    pub async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        schedule.validate()?;
        // The source must exist before a cron binding makes sense.
        self.sources.get_source(&schedule.source_id).await?;
        self.schedules.create_schedule(&schedule).await?;
        self.scheduler.reload_schedules().await?;
        info!(schedule_id = %schedule.id, "Schedule created");
        Ok(schedule)
    }

    pub async fn update_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        schedule.validate()?;
        self.sources.get_source(&schedule.source_id).await?;
        self.schedules.update_schedule(&schedule).await?;
        self.scheduler.reload_schedules().await?;
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<()> {
        self.schedules.delete_schedule(id).await?;
        self.scheduler.reload_schedules().await
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.schedules.list_schedules().await
    }

    // --- Subscriptions ---

    pub async fn upsert_subscription(&self, subscription: Subscription) -> Result<()> {
        self.devices.get_device(&subscription.device_id).await?;
        self.sources.get_source(&subscription.source_id).await?;
        self.subscriptions.upsert_subscription(&subscription).await
    }

    pub async fn delete_subscription(&self, device_id: &str, source_id: &str) -> Result<()> {
        self.subscriptions
            .delete_subscription(device_id, source_id)
            .await
    }

    pub async fn list_subscriptions_for_device(&self, device_id: &str) -> Result<Vec<Subscription>> {
        self.subscriptions
            .list_subscriptions_for_device(device_id)
            .await
    }

    pub async fn list_subscriptions_for_source(&self, source_id: &str) -> Result<Vec<Subscription>> {
        self.subscriptions
            .list_subscriptions_for_source(source_id)
            .await
    }

    // --- Runs ---

    /// Insert a pending run for a source, optionally nudging the processor
    /// to pick it up without waiting for the poll cron.
    pub async fn create_manual_run(&self, source_id: &str, trigger: bool) -> Result<Run> {
        let source = self.sources.get_source(source_id).await?;
        if !source.enabled {
            return Err(Error::validation("source is disabled"));
        }

        let input = serde_json::json!({ "sourceId": source.id, "manual": true });
        let run = Run::fetch_source(&source.id).with_input(input.to_string());
        self.runs.create_run(&run).await?;
        info!(run_id = %run.id, source = %source.name, "Manual run created");

        if trigger {
            self.scheduler.processor().trigger_processing().await?;
        }
        Ok(run)
    }

    /// PENDING → CANCELLED; any other state is rejected.
    pub async fn cancel_pending_run(&self, run_id: &str) -> Result<()> {
        self.runs.cancel_pending_run(run_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.runs.get_run(run_id).await
    }

    pub async fn list_recent_runs(&self, limit: u32) -> Result<Vec<Run>> {
        self.runs.list_recent_runs(limit).await
    }

    /// Retention: drop terminal runs older than `days`.
    pub async fn purge_runs(&self, days: u32) -> Result<u64> {
        let purged = self.runs.purge_runs_older_than(days).await?;
        if purged > 0 {
            info!(purged, days, "Old runs purged");
        }
        Ok(purged)
    }

    // --- Gallery ---

    pub async fn totals(&self) -> Result<Totals> {
        Ok(Totals {
            devices: self.devices.count_devices().await?,
            sources: self.sources.count_sources().await?,
            images: self.images.count_images().await?,
            device_images: self.images.count_device_images().await?,
            runs: self.runs.count_runs_by_state().await?,
        })
    }

    /// Recent images, newest first, cursor `"{epochMillis}_{id}"`.
    pub async fn page_images(&self, cursor: Option<&str>, limit: u32) -> Result<GalleryPage> {
        self.images.page_images(cursor, limit).await
    }
}
