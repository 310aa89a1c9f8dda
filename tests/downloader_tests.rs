//! Downloader behaviour against a live local HTTP server: the slow-speed
//! watchdog, the concurrency bound and per-item outcome reporting.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fallpaper::downloader::{DownloadOutcome, Downloader, DownloaderConfig};

use support::spawn_image_server;

fn watchdog_config() -> DownloaderConfig {
    DownloaderConfig {
        max_concurrent: 4,
        min_speed_bytes_per_sec: 10 * 1024,
        slow_speed_timeout: Duration::from_millis(600),
        speed_check_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(30),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fast_transfer_succeeds_with_content_type() {
    let server = spawn_image_server().await;
    let downloader = Downloader::new(watchdog_config());

    let outcome = downloader
        .download(
            &format!("{}/png/1080x2400.png", server.base_url),
            &CancellationToken::new(),
        )
        .await;

    match outcome {
        DownloadOutcome::Success {
            bytes,
            content_type,
        } => {
            assert_eq!(content_type.as_deref(), Some("image/png"));
            assert_eq!(bytes, support::png_bytes(1080, 2400));
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sustained_slow_transfer_is_aborted_as_slow() {
    let server = spawn_image_server().await;
    let downloader = Downloader::new(watchdog_config());

    let started = std::time::Instant::now();
    let outcome = downloader
        .download(
            &format!("{}/slow.png", server.base_url),
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.is_slow_abort(), "expected slow abort, got {:?}", outcome);
    // Aborted after roughly the slow timeout, well before the request deadline.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread")]
async fn non_2xx_status_is_a_plain_failure() {
    let server = spawn_image_server().await;
    let downloader = Downloader::new(watchdog_config());

    let outcome = downloader
        .download(
            &format!("{}/missing.png", server.base_url),
            &CancellationToken::new(),
        )
        .await;

    match outcome {
        DownloadOutcome::Failure { error, slow_abort } => {
            assert!(!slow_abort);
            assert!(error.contains("404"), "unexpected error: {}", error);
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn download_all_is_bounded_ordered_and_not_fail_fast() {
    let server = spawn_image_server().await;
    let downloader = Arc::new(Downloader::new(watchdog_config()));

    // 12 held transfers keep connections open long enough to observe the
    // concurrency ceiling; two bad items are sprinkled in.
    let mut items: Vec<(String, usize)> = Vec::new();
    for i in 0..12 {
        items.push((format!("{}/held.png", server.base_url), i));
    }
    items.insert(3, (format!("{}/missing.png", server.base_url), 100));
    items.insert(9, (format!("{}/missing.png", server.base_url), 101));

    let results = downloader
        .download_all(items.clone(), &CancellationToken::new())
        .await;

    // Input order is preserved via the context values.
    let contexts: Vec<usize> = results.iter().map(|(ctx, _)| *ctx).collect();
    let expected: Vec<usize> = items.iter().map(|(_, ctx)| *ctx).collect();
    assert_eq!(contexts, expected);

    let failures = results
        .iter()
        .filter(|(_, outcome)| !outcome.is_success())
        .count();
    assert_eq!(failures, 2, "only the two 404 items may fail");

    let max_seen = server.stats.max_concurrent.load(Ordering::SeqCst);
    assert!(
        max_seen <= 4,
        "observed {} concurrent transfers, bound is 4",
        max_seen
    );
    assert_eq!(server.stats.requests.load(Ordering::SeqCst), 14);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_aborts_in_flight_transfers() {
    let server = spawn_image_server().await;
    let downloader = Downloader::new(watchdog_config());

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_clone.cancel();
    });

    let outcome = downloader
        .download(&format!("{}/slow.png", server.base_url), &cancel)
        .await;

    match outcome {
        DownloadOutcome::Failure { error, slow_abort } => {
            assert!(!slow_abort);
            assert!(error.contains("cancelled"), "unexpected error: {}", error);
        }
        other => panic!("expected cancellation failure, got {:?}", other),
    }
}
