//! Shared fixtures for the integration tests: a fully wired service over a
//! scratch database and a minimal HTTP server with controllable behaviour.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use fallpaper::admin::AdminService;
use fallpaper::config::SchedulerConfig;
use fallpaper::database::repositories::{
    SqlxDeviceRepository, SqlxImageRepository, SqlxRunRepository, SqlxScheduleRepository,
    SqlxSourceRepository, SqlxSubscriptionRepository,
};
use fallpaper::database::{self, DbPool};
use fallpaper::downloader::{Downloader, DownloaderConfig};
use fallpaper::processor::ImageProcessor;
use fallpaper::runner::SourceRunner;
use fallpaper::scheduler::{CronScheduler, RunProcessor};
use fallpaper::sources::{AdapterRegistry, CandidateItem};

/// A PNG header with the given dimensions; enough for the sniffer.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    // Pad so filesize-based assertions have something to chew on.
    bytes.extend_from_slice(&[0u8; 256]);
    bytes
}

/// The fully wired service under test.
pub struct TestApp {
    pub pool: DbPool,
    pub devices: Arc<SqlxDeviceRepository>,
    pub sources: Arc<SqlxSourceRepository>,
    pub schedules: Arc<SqlxScheduleRepository>,
    pub subscriptions: Arc<SqlxSubscriptionRepository>,
    pub runs: Arc<SqlxRunRepository>,
    pub images: Arc<SqlxImageRepository>,
    pub registry: Arc<AdapterRegistry>,
    pub processor: Arc<RunProcessor>,
    pub scheduler: Arc<CronScheduler>,
    pub admin: AdminService,
    pub image_dir: std::path::PathBuf,
    pub shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

/// Wire the whole service against a scratch database and directories.
/// The scheduler is constructed but not started; tests drive ticks directly.
pub async fn test_app(registry: AdapterRegistry, scheduler_config: SchedulerConfig) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fallpaper.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = database::init_pool(&db_url, false).await.unwrap();
    database::run_migrations(&pool).await.unwrap();

    let devices = Arc::new(SqlxDeviceRepository::new(pool.clone()));
    let sources = Arc::new(SqlxSourceRepository::new(pool.clone()));
    let schedules = Arc::new(SqlxScheduleRepository::new(pool.clone()));
    let subscriptions = Arc::new(SqlxSubscriptionRepository::new(pool.clone()));
    let runs = Arc::new(SqlxRunRepository::new(pool.clone()));
    let images = Arc::new(SqlxImageRepository::new(pool.clone()));

    let registry = Arc::new(registry);
    let downloader = Arc::new(Downloader::new(DownloaderConfig {
        max_concurrent: 4,
        request_timeout: Duration::from_secs(10),
        ..DownloaderConfig::default()
    }));

    let image_dir = dir.path().join("images");
    let image_processor = ImageProcessor::new(
        images.clone(),
        image_dir.clone(),
        dir.path().join("tmp"),
    );

    let runner = Arc::new(SourceRunner::new(
        sources.clone(),
        subscriptions.clone(),
        runs.clone(),
        images.clone(),
        registry.clone(),
        downloader,
        image_processor,
    ));

    let shutdown = CancellationToken::new();
    let processor = Arc::new(RunProcessor::new(
        runs.clone(),
        runner,
        scheduler_config.clone(),
        shutdown.child_token(),
    ));

    let scheduler = Arc::new(CronScheduler::new(
        schedules.clone(),
        sources.clone(),
        runs.clone(),
        processor.clone(),
        scheduler_config.poll_cron.clone(),
        shutdown.clone(),
    ));

    let admin = AdminService::new(
        devices.clone(),
        sources.clone(),
        schedules.clone(),
        subscriptions.clone(),
        runs.clone(),
        images.clone(),
        registry.clone(),
        scheduler.clone(),
    );

    TestApp {
        pool,
        devices,
        sources,
        schedules,
        subscriptions,
        runs,
        images,
        registry,
        processor,
        scheduler,
        admin,
        image_dir,
        shutdown,
        _dir: dir,
    }
}

/// Build a static-adapter candidate pointing at the fixture server.
pub fn candidate(base_url: &str, path: &str, nsfw: bool) -> CandidateItem {
    CandidateItem {
        download_url: format!("{}{}", base_url, path),
        website_url: format!("{}/view{}", base_url, path),
        title: None,
        author: None,
        author_url: None,
        nsfw,
        source_created_at: None,
        width: None,
        height: None,
    }
}

/// Counters exposed by the fixture server.
#[derive(Default)]
pub struct ServerStats {
    current: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub requests: AtomicUsize,
}

/// A minimal HTTP/1.1 server understanding the fixture paths:
///
/// - `/png/{w}x{h}.png` — 200, `image/png`, synthetic header bytes
/// - `/slow.png` — 1 KiB burst, then a trickle of one byte every 200 ms
/// - `/held.png` — 200 after holding the connection ~300 ms
/// - anything else — 404
pub struct ImageServer {
    pub base_url: String,
    pub stats: Arc<ServerStats>,
}

pub async fn spawn_image_server() -> ImageServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(ServerStats::default());

    let server_stats = stats.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let stats = server_stats.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, stats).await;
            });
        }
    });

    ImageServer {
        base_url: format!("http://{}", addr),
        stats,
    }
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    stats: Arc<ServerStats>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 4096];
    let mut read = 0usize;
    loop {
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            return Ok(());
        }
        read += n;
        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf[..read]);
    let path = request
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    stats.requests.fetch_add(1, Ordering::SeqCst);
    let current = stats.current.fetch_add(1, Ordering::SeqCst) + 1;
    stats.max_concurrent.fetch_max(current, Ordering::SeqCst);

    let result = respond(&mut stream, &path).await;

    stats.current.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn respond(stream: &mut tokio::net::TcpStream, path: &str) -> std::io::Result<()> {
    if let Some(dims) = path
        .strip_prefix("/png/")
        .and_then(|rest| rest.strip_suffix(".png"))
    {
        let Some((w, h)) = dims.split_once('x') else {
            return write_not_found(stream).await;
        };
        let (Ok(w), Ok(h)) = (w.parse::<u32>(), h.parse::<u32>()) else {
            return write_not_found(stream).await;
        };

        let body = png_bytes(w, h);
        write_ok_header(stream, "image/png", body.len()).await?;
        stream.write_all(&body).await?;
        return stream.flush().await;
    }

    if path == "/slow.png" {
        // Declare a large body, deliver a burst, then trickle.
        write_ok_header(stream, "image/png", 1024 * 1024).await?;
        stream.write_all(&vec![0u8; 1024]).await?;
        stream.flush().await?;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if stream.write_all(&[0u8]).await.is_err() {
                return Ok(());
            }
            let _ = stream.flush().await;
        }
        return Ok(());
    }

    if path == "/held.png" {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let body = png_bytes(1080, 2400);
        write_ok_header(stream, "image/png", body.len()).await?;
        stream.write_all(&body).await?;
        return stream.flush().await;
    }

    write_not_found(stream).await
}

async fn write_ok_header(
    stream: &mut tokio::net::TcpStream,
    content_type: &str,
    content_length: usize,
) -> std::io::Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content_type, content_length
    );
    stream.write_all(header.as_bytes()).await
}

async fn write_not_found(stream: &mut tokio::net::TcpStream) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await?;
    stream.flush().await
}
