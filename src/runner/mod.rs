//! Source runner: drives one fetch run end to end.
//!
//! Loads the source and its subscribed devices, validates adapter params,
//! pages candidates out of the adapter, prunes already-known download URLs
//! per batch, then hands the survivors to the downloader + processor.
//! Progress is written back to the run row at batch boundaries.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::database::models::{Device, Source};
use crate::database::repositories::{
    ImageRepository, RunRepository, SourceRepository, SubscriptionRepository,
};
use crate::downloader::Downloader;
use crate::processor::{BatchOutcome, ImageProcessor, ItemDetail};
use crate::sources::AdapterRegistry;
use crate::{Error, Result};

/// Skip reason when no enabled subscription points at an enabled device.
pub const NO_SUBSCRIBED_DEVICES: &str = "no eligible devices subscribed";

/// Skip message for candidates pruned by the download-URL dedup.
pub const ALREADY_DOWNLOADED: &str = "already downloaded";

/// Aggregated result of one run, persisted as the run's output JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub images_found: u64,
    pub images_downloaded: u64,
    pub images_skipped: u64,
    pub images_failed: u64,
    pub items: Vec<ItemDetail>,
}

impl RunReport {
    fn skipped(reason: &str) -> Self {
        Self {
            success: true,
            skip_reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    fn absorb(&mut self, outcome: BatchOutcome) {
        self.images_downloaded += outcome.downloaded;
        self.images_skipped += outcome.skipped;
        self.images_failed += outcome.failed;
        self.items.extend(outcome.items);
    }

    pub fn to_output_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Human-readable closing progress message.
    pub fn final_message(&self) -> String {
        match &self.skip_reason {
            Some(reason) => format!("Skipped: {}", reason),
            None => format!(
                "Downloaded {} of {} candidates ({} skipped, {} failed)",
                self.images_downloaded, self.images_found, self.images_skipped, self.images_failed
            ),
        }
    }
}

/// Orchestrates one run of one source.
pub struct SourceRunner {
    sources: Arc<dyn SourceRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    runs: Arc<dyn RunRepository>,
    images: Arc<dyn ImageRepository>,
    registry: Arc<AdapterRegistry>,
    downloader: Arc<Downloader>,
    processor: ImageProcessor,
}

impl SourceRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        runs: Arc<dyn RunRepository>,
        images: Arc<dyn ImageRepository>,
        registry: Arc<AdapterRegistry>,
        downloader: Arc<Downloader>,
        processor: ImageProcessor,
    ) -> Self {
        Self {
            sources,
            subscriptions,
            runs,
            images,
            registry,
            downloader,
            processor,
        }
    }

    /// Execute the fetch for `run_id` / `source_id`.
    ///
    /// Returns `Ok` with a report when the fetch pipeline ran to completion
    /// (individual download failures included); returns `Err` when the run
    /// as a whole could not proceed (missing source, bad params, adapter
    /// abort). Progress written so far stays persisted either way.
    pub async fn run(
        &self,
        run_id: &str,
        source_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let source = match self.sources.get_source(source_id).await {
            Ok(source) => source,
            Err(Error::NotFound { .. }) => {
                return Err(Error::validation("source not found"));
            }
            Err(e) => return Err(e),
        };

        if !source.enabled {
            info!(source = %source.name, "Source disabled; skipping run");
            return Ok(RunReport::skipped("source is disabled"));
        }

        let devices = self.subscriptions.list_subscribed_devices(&source.id).await?;
        if devices.is_empty() {
            info!(source = %source.name, "No subscribed devices; skipping run");
            return Ok(RunReport::skipped(NO_SUBSCRIBED_DEVICES));
        }

        let adapter = self.registry.resolve(&source.kind)?;
        let params = source.params_json()?;
        adapter.validate_params(&params)?;

        info!(
            source = %source.name,
            kind = %source.kind,
            devices = devices.len(),
            lookup_limit = source.lookup_limit,
            "Starting source fetch"
        );

        self.fetch_batches(run_id, &source, &devices, adapter, params, cancel)
            .await
    }

    async fn fetch_batches(
        &self,
        run_id: &str,
        source: &Source,
        devices: &[Device],
        adapter: Arc<dyn crate::sources::SourceAdapter>,
        params: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let limit = source.lookup_limit.max(0) as usize;
        let mut batches = adapter.fetch_batches(params, limit, cancel.clone());

        let mut report = RunReport {
            success: true,
            ..RunReport::default()
        };

        while let Some(batch) = batches.recv().await {
            let batch = batch.map_err(|e| {
                warn!(source = %source.name, error = %e, "Adapter aborted the run");
                e
            })?;
            if batch.is_empty() {
                continue;
            }

            report.images_found += batch.len() as u64;

            // One indexed query prunes candidates already persisted.
            let urls: Vec<String> = batch
                .items
                .iter()
                .map(|item| item.download_url.clone())
                .collect();
            let known = self.images.filter_known_download_urls(&urls).await?;

            let mut survivors = Vec::with_capacity(batch.items.len());
            for item in batch.items {
                if known.contains(&item.download_url) {
                    report.images_skipped += 1;
                    report
                        .items
                        .push(ItemDetail::skipped(&item.download_url, ALREADY_DOWNLOADED));
                } else {
                    survivors.push(item);
                }
            }

            if !survivors.is_empty() {
                let outcome = self
                    .processor
                    .download_and_process_images(
                        &self.downloader,
                        survivors,
                        devices,
                        &source.id,
                        cancel,
                    )
                    .await;
                report.absorb(outcome);
            }

            self.update_progress(run_id, &report).await;

            if cancel.is_cancelled() {
                return Err(Error::Other("run cancelled".to_string()));
            }
        }

        info!(
            source = %source.name,
            found = report.images_found,
            downloaded = report.images_downloaded,
            skipped = report.images_skipped,
            failed = report.images_failed,
            "Source fetch finished"
        );
        Ok(report)
    }

    /// Progress is best-effort: a failed write never fails the run.
    async fn update_progress(&self, run_id: &str, report: &RunReport) {
        let message = format!(
            "Processed {} of {} candidates",
            report.images_downloaded + report.images_skipped + report.images_failed,
            report.images_found
        );
        if let Err(e) = self
            .runs
            .update_progress(
                run_id,
                report.images_downloaded as i64,
                report.images_found as i64,
                &message,
            )
            .await
        {
            warn!(run_id = %run_id, error = %e, "Could not update run progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serialises_with_camel_case_keys() {
        let mut report = RunReport {
            success: true,
            ..RunReport::default()
        };
        report.images_found = 10;
        report.images_downloaded = 4;
        let json: serde_json::Value = serde_json::from_str(&report.to_output_json()).unwrap();
        assert_eq!(json["imagesFound"], 10);
        assert_eq!(json["imagesDownloaded"], 4);
        assert!(json.get("skipReason").is_none());
    }

    #[test]
    fn skip_report_carries_the_reason() {
        let report = RunReport::skipped("source is disabled");
        assert!(report.success);
        assert_eq!(report.final_message(), "Skipped: source is disabled");
    }
}
