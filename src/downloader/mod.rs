//! Bounded-concurrency streaming downloader with a per-transfer speed
//! watchdog.
//!
//! Each transfer streams the body chunk by chunk. A timer samples throughput
//! every `speed_check_interval`; once throughput stays below
//! `min_speed_bytes_per_sec` for `slow_speed_timeout` the transfer is
//! cancelled and reported as a slow-abort. An overall request deadline and
//! the caller's cancellation token also terminate the transfer.
//! `download_all` runs up to `max_concurrent` transfers at a time and is not
//! fail-fast: every item gets an outcome, in input order.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RunnerConfig;

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("fallpaper/", env!("CARGO_PKG_VERSION"));

/// Downloader settings.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Maximum concurrent transfers.
    pub max_concurrent: usize,
    /// Throughput floor in bytes per second.
    pub min_speed_bytes_per_sec: u64,
    /// How long throughput may stay below the floor before abort.
    pub slow_speed_timeout: Duration,
    /// Interval between throughput samples.
    pub speed_check_interval: Duration,
    /// Overall per-request deadline.
    pub request_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            min_speed_bytes_per_sec: 10 * 1024,
            slow_speed_timeout: Duration::from_secs(30),
            speed_check_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&RunnerConfig> for DownloaderConfig {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_downloads,
            min_speed_bytes_per_sec: config.min_speed_bytes_per_sec,
            slow_speed_timeout: Duration::from_millis(config.slow_speed_timeout_ms),
            speed_check_interval: Duration::from_millis(config.speed_check_interval_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

/// Outcome of one transfer.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Success {
        bytes: Bytes,
        content_type: Option<String>,
    },
    Failure {
        error: String,
        /// True when the speed watchdog cancelled the transfer.
        slow_abort: bool,
    },
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_slow_abort(&self) -> bool {
        matches!(
            self,
            Self::Failure {
                slow_abort: true,
                ..
            }
        )
    }

    fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            slow_abort: false,
        }
    }

    fn slow_abort(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            slow_abort: true,
        }
    }
}

/// The streaming downloader. Cheap to share: the HTTP client is internally
/// reference-counted and the semaphore is the only shared state.
pub struct Downloader {
    client: reqwest::Client,
    config: DownloaderConfig,
    semaphore: Arc<Semaphore>,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self::with_client(client, config)
    }

    pub fn with_client(client: reqwest::Client, config: DownloaderConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            client,
            config,
            semaphore,
        }
    }

    /// Download one URL to memory, subject to the watchdog, the request
    /// deadline and `cancel`.
    pub async fn download(&self, url: &str, cancel: &CancellationToken) -> DownloadOutcome {
        fetch(
            self.client.clone(),
            self.config.clone(),
            url.to_string(),
            cancel.clone(),
        )
        .await
    }

    /// Download every item, at most `max_concurrent` at a time. Results come
    /// back in input order, one per item; a failed transfer never cancels
    /// the others.
    pub async fn download_all<C: Send + 'static>(
        &self,
        items: Vec<(String, C)>,
        cancel: &CancellationToken,
    ) -> Vec<(C, DownloadOutcome)> {
        let mut contexts: Vec<Option<C>> = Vec::with_capacity(items.len());
        let mut outcomes: Vec<Option<DownloadOutcome>> = Vec::with_capacity(items.len());
        let mut tasks = JoinSet::new();

        for (index, (url, context)) in items.into_iter().enumerate() {
            contexts.push(Some(context));
            outcomes.push(None);

            let client = self.client.clone();
            let config = self.config.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, DownloadOutcome::failure("downloader shut down"));
                };
                let outcome = fetch(client, config, url, cancel).await;
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!(error = %e, "Download task panicked"),
            }
        }

        contexts
            .into_iter()
            .zip(outcomes)
            .map(|(context, outcome)| {
                (
                    context.expect("context taken once"),
                    outcome.unwrap_or_else(|| DownloadOutcome::failure("download task panicked")),
                )
            })
            .collect()
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }
}

/// One watched transfer.
async fn fetch(
    client: reqwest::Client,
    config: DownloaderConfig,
    url: String,
    cancel: CancellationToken,
) -> DownloadOutcome {
    let deadline = tokio::time::sleep(config.request_timeout);
    tokio::pin!(deadline);

    let response = tokio::select! {
        _ = cancel.cancelled() => return DownloadOutcome::failure("download cancelled"),
        _ = &mut deadline => return DownloadOutcome::failure("request timed out"),
        response = client.get(&url).send() => match response {
            Ok(response) => response,
            Err(e) => return DownloadOutcome::failure(format!("request failed: {}", e)),
        },
    };

    let status = response.status();
    if !status.is_success() {
        let reason = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };
        return DownloadOutcome::failure(format!("HTTP {}", reason));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let mut stream = response.bytes_stream();
    let mut body: Vec<u8> = Vec::new();

    // The first interval tick fires after one full period, not immediately,
    // so the first sample covers a real window.
    let check_every = config.speed_check_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + check_every, check_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut bytes_since_check: u64 = 0;
    let mut last_check = Instant::now();
    let mut slow_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return DownloadOutcome::failure("download cancelled");
            }
            _ = &mut deadline => {
                return DownloadOutcome::failure("request timed out");
            }
            _ = ticker.tick() => {
                let elapsed = last_check.elapsed().as_secs_f64().max(f64::EPSILON);
                let speed = bytes_since_check as f64 / elapsed;
                bytes_since_check = 0;
                last_check = Instant::now();

                if speed >= config.min_speed_bytes_per_sec as f64 {
                    slow_since = None;
                } else {
                    let since = *slow_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= config.slow_speed_timeout {
                        warn!(url = %url, speed_bps = speed as u64, "Aborting slow transfer");
                        return DownloadOutcome::slow_abort(format!(
                            "transfer stayed below {} B/s for {:?}",
                            config.min_speed_bytes_per_sec,
                            config.slow_speed_timeout
                        ));
                    }
                    debug!(url = %url, speed_bps = speed as u64, "Transfer below speed floor");
                }
            }
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => {
                    bytes_since_check += chunk.len() as u64;
                    body.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    return DownloadOutcome::failure(format!("stream error: {}", e));
                }
                None => {
                    return DownloadOutcome::Success {
                        bytes: Bytes::from(body),
                        content_type,
                    };
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_config_conversion() {
        let runner = RunnerConfig::default();
        let config = DownloaderConfig::from(&runner);
        assert_eq!(config.max_concurrent, runner.max_concurrent_downloads);
        assert_eq!(config.speed_check_interval, Duration::from_secs(1));
    }

    #[test]
    fn outcome_predicates() {
        assert!(DownloadOutcome::Success {
            bytes: Bytes::new(),
            content_type: None
        }
        .is_success());
        assert!(DownloadOutcome::slow_abort("slow").is_slow_abort());
        assert!(!DownloadOutcome::failure("other").is_slow_abort());
    }
}
