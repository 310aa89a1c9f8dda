use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use fallpaper::admin::AdminService;
use fallpaper::config::{AppConfig, ConfigHandle};
use fallpaper::database::repositories::{
    SqlxDeviceRepository, SqlxImageRepository, SqlxRunRepository, SqlxScheduleRepository,
    SqlxSourceRepository, SqlxSubscriptionRepository,
};
use fallpaper::downloader::{Downloader, DownloaderConfig};
use fallpaper::processor::ImageProcessor;
use fallpaper::runner::SourceRunner;
use fallpaper::scheduler::{CronScheduler, RunProcessor};
use fallpaper::sources::AdapterRegistry;
use fallpaper::utils::fs as fsutil;
use fallpaper::{database, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    dotenvy::dotenv().ok();

    let config_handle = ConfigHandle::new(AppConfig::load()?);
    let config = config_handle.current();

    database::retry::set_statement_tracing(config.database.tracing);

    fsutil::ensure_dir_all(&config.image_dir()).await?;
    fsutil::ensure_dir_all(&config.temp_dir()).await?;
    let swept = fsutil::sweep_temp_dir(&config.temp_dir()).await;
    if swept > 0 {
        info!(swept, "Removed leftover staging files");
    }

    let pool = database::init_pool_from_config(&config.database).await?;
    database::run_migrations(&pool).await?;

    let devices = Arc::new(SqlxDeviceRepository::new(pool.clone()));
    let sources = Arc::new(SqlxSourceRepository::new(pool.clone()));
    let schedules = Arc::new(SqlxScheduleRepository::new(pool.clone()));
    let subscriptions = Arc::new(SqlxSubscriptionRepository::new(pool.clone()));
    let runs = Arc::new(SqlxRunRepository::new(pool.clone()));
    let images = Arc::new(SqlxImageRepository::new(pool.clone()));

    let registry = Arc::new(AdapterRegistry::with_builtins());
    let downloader = Arc::new(Downloader::new(DownloaderConfig::from(&config.runner)));
    let processor = ImageProcessor::new(
        images.clone(),
        config.image_dir(),
        config.temp_dir(),
    );

    let runner = Arc::new(SourceRunner::new(
        sources.clone(),
        subscriptions.clone(),
        runs.clone(),
        images.clone(),
        registry.clone(),
        downloader,
        processor,
    ));

    let shutdown = CancellationToken::new();
    let run_processor = Arc::new(RunProcessor::new(
        runs.clone(),
        runner,
        config.scheduler.clone(),
        shutdown.child_token(),
    ));

    let scheduler = Arc::new(CronScheduler::new(
        schedules.clone(),
        sources.clone(),
        runs.clone(),
        run_processor,
        config.scheduler.poll_cron.clone(),
        shutdown.clone(),
    ));
    scheduler.start().await?;

    // Handed to the (external) web layer; kept alive for the process.
    let _admin = AdminService::new(
        devices,
        sources,
        schedules,
        subscriptions,
        runs,
        images,
        registry,
        scheduler.clone(),
    );

    info!(version = env!("CARGO_PKG_VERSION"), "fallpaper is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.shutdown();
    pool.close().await;

    Ok(())
}
