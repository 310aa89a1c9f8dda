//! Image processing: dedup hashing, format/dimension detection, staging and
//! fan-out into per-device directories.
//!
//! One processed item ends in exactly one of two states: the Image row plus
//! every intended DeviceImage row and file exist, or the Image row is absent
//! and the staged temp file is removed. A fan-out that cannot reach the
//! first state is unwound and reported as a failure so the run-level retry
//! can have another go.

pub mod dimensions;
pub mod format;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::database::models::{Device, DeviceImage, NewImage};
use crate::database::repositories::ImageRepository;
use crate::downloader::{DownloadOutcome, Downloader};
use crate::eligibility::{find_eligible_devices, ImageMeta};
use crate::sources::CandidateItem;
use crate::utils::fs as fsutil;
use crate::{Error, Result};

pub use dimensions::Dimensions;
pub use format::ImageFormat;

/// Skip reason when no subscribed device wants the image.
pub const NO_ELIGIBLE_DEVICES: &str = "no eligible devices";

/// Final status of one candidate item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Materialised onto at least one device.
    Downloaded,
    /// Intentionally not materialised (already known, nobody eligible,
    /// transfer too slow).
    Skipped,
    /// Errored: bad download, unreadable image, store failure.
    Failed,
}

/// Per-item detail recorded into the run output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDetail {
    pub download_url: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_slugs: Vec<String>,
}

impl ItemDetail {
    fn downloaded(url: &str, image_id: String, device_slugs: Vec<String>) -> Self {
        Self {
            download_url: url.to_string(),
            status: ItemStatus::Downloaded,
            message: None,
            image_id: Some(image_id),
            device_slugs,
        }
    }

    pub fn skipped(url: &str, message: impl Into<String>) -> Self {
        Self {
            download_url: url.to_string(),
            status: ItemStatus::Skipped,
            message: Some(message.into()),
            image_id: None,
            device_slugs: Vec::new(),
        }
    }

    fn failed(url: &str, message: impl Into<String>) -> Self {
        Self {
            download_url: url.to_string(),
            status: ItemStatus::Failed,
            message: Some(message.into()),
            image_id: None,
            device_slugs: Vec::new(),
        }
    }
}

/// Aggregate outcome of one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Items handed to the pipeline.
    pub processed: u64,
    /// Items materialised onto at least one device.
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub items: Vec<ItemDetail>,
}

impl BatchOutcome {
    pub fn record(&mut self, detail: ItemDetail) {
        self.processed += 1;
        match detail.status {
            ItemStatus::Downloaded => self.downloaded += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Failed => self.failed += 1,
        }
        self.items.push(detail);
    }

}

/// The image processor.
pub struct ImageProcessor {
    images: Arc<dyn ImageRepository>,
    image_dir: PathBuf,
    temp_dir: PathBuf,
}

impl ImageProcessor {
    pub fn new(images: Arc<dyn ImageRepository>, image_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            images,
            image_dir,
            temp_dir,
        }
    }

    /// Download every candidate and process the successful transfers.
    /// One failure never stops the batch.
    pub async fn download_and_process_images(
        &self,
        downloader: &Downloader,
        candidates: Vec<CandidateItem>,
        devices: &[Device],
        source_id: &str,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let items: Vec<(String, CandidateItem)> = candidates
            .into_iter()
            .map(|candidate| (candidate.download_url.clone(), candidate))
            .collect();

        let mut outcome = BatchOutcome::default();
        for (candidate, download) in downloader.download_all(items, cancel).await {
            let url = candidate.download_url.clone();
            let detail = match download {
                DownloadOutcome::Success {
                    bytes,
                    content_type,
                } => {
                    match self
                        .process_image(bytes, content_type.as_deref(), &candidate, devices, source_id)
                        .await
                    {
                        Ok(detail) => detail,
                        Err(e) => {
                            warn!(url = %url, error = %e, "Image processing failed");
                            ItemDetail::failed(&url, e.to_string())
                        }
                    }
                }
                DownloadOutcome::Failure { error, slow_abort } if slow_abort => {
                    ItemDetail::skipped(&url, format!("slow transfer aborted: {}", error))
                }
                DownloadOutcome::Failure { error, .. } => ItemDetail::failed(&url, error),
            };
            outcome.record(detail);
        }
        outcome
    }

    /// Process one downloaded buffer: sniff, hash, re-filter, stage, fan out.
    pub async fn process_image(
        &self,
        bytes: Bytes,
        content_type: Option<&str>,
        candidate: &CandidateItem,
        devices: &[Device],
        source_id: &str,
    ) -> Result<ItemDetail> {
        let format = ImageFormat::detect(content_type, &candidate.download_url)
            .ok_or_else(|| Error::Processing("could not determine image format".to_string()))?;

        let dims = dimensions::detect(format, &bytes)
            .ok_or_else(|| Error::Processing("could not determine image dimensions".to_string()))?;

        let checksum = hex::encode(Md5::digest(&bytes));

        // Upstream metadata may have lacked dimensions; re-evaluate with the
        // real numbers and the real filesize.
        let meta = ImageMeta {
            width: i64::from(dims.width),
            height: i64::from(dims.height),
            filesize: bytes.len() as i64,
            nsfw: candidate.nsfw,
        };
        let eligible: Vec<Device> = find_eligible_devices(devices, &meta)
            .into_iter()
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Ok(ItemDetail::skipped(
                &candidate.download_url,
                NO_ELIGIBLE_DEVICES,
            ));
        }

        // Stage to the temp directory before any row exists.
        fsutil::ensure_dir_all(&self.temp_dir).await?;
        let temp_path = fsutil::unique_temp_path(&self.temp_dir);
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| fsutil::io_error("staging download", &temp_path, e))?;

        let image = NewImage {
            source_id: source_id.to_string(),
            website_url: candidate.website_url.clone(),
            download_url: candidate.download_url.clone(),
            checksum,
            width: meta.width,
            height: meta.height,
            filesize: meta.filesize,
            format: format.ext().to_string(),
            nsfw: candidate.nsfw,
            title: candidate.title.clone(),
            author: candidate.author.clone(),
            author_url: candidate.author_url.clone(),
            source_created_at: candidate.source_created_at,
        }
        .into_image();

        if let Err(e) = self.images.create_image(&image).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        match self.fan_out(&image.id, format, &temp_path, &eligible).await {
            Ok(slugs) => {
                debug!(image_id = %image.id, devices = slugs.len(), "Image materialised");
                Ok(ItemDetail::downloaded(
                    &candidate.download_url,
                    image.id,
                    slugs,
                ))
            }
            Err(e) => {
                self.unwind_fan_out(&image.id, &temp_path).await;
                Err(e)
            }
        }
    }

    /// Move the staged file to the first device and copy it to the rest,
    /// inserting one DeviceImage row per placement.
    async fn fan_out(
        &self,
        image_id: &str,
        format: ImageFormat,
        temp_path: &Path,
        devices: &[Device],
    ) -> Result<Vec<String>> {
        let mut slugs = Vec::with_capacity(devices.len());
        let mut first_path: Option<PathBuf> = None;

        for device in devices {
            let device_dir = self.image_dir.join(&device.slug);
            fsutil::ensure_dir_all(&device_dir).await?;
            let dest = device_dir.join(format!("{}.{}", image_id, format.ext()));

            match &first_path {
                None => {
                    move_file(temp_path, &dest).await?;
                    first_path = Some(dest.clone());
                }
                Some(first) => {
                    tokio::fs::copy(first, &dest)
                        .await
                        .map_err(|e| fsutil::io_error("copying image", &dest, e))?;
                }
            }

            let placement =
                DeviceImage::new(&device.id, image_id, dest.to_string_lossy().to_string());
            self.images.create_device_image(&placement).await?;
            slugs.push(device.slug.clone());
        }

        Ok(slugs)
    }

    /// Undo a partial fan-out so the store and the filesystem agree again:
    /// drop the placements and their files, drop the Image row, drop the
    /// staged temp file.
    async fn unwind_fan_out(&self, image_id: &str, temp_path: &Path) {
        if let Ok(placements) = self.images.list_device_images_for_image(image_id).await {
            for placement in placements {
                let _ = tokio::fs::remove_file(&placement.local_path).await;
                if let Err(e) = self.images.delete_device_image(&placement.id).await {
                    warn!(id = %placement.id, error = %e, "Could not remove device image row");
                }
            }
        }
        if let Err(e) = self.images.delete_image(image_id).await {
            warn!(id = %image_id, error = %e, "Could not remove image row");
        }
        let _ = tokio::fs::remove_file(temp_path).await;
    }
}

/// Rename, falling back to copy + remove when the rename crosses devices.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| fsutil::io_error("copying image", to, e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| fsutil::io_error("removing staged file", from, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Source;
    use crate::database::repositories::{
        ImageRepository, SourceRepository, SqlxImageRepository, SqlxSourceRepository,
    };
    use crate::database::test_pool;

    fn png_candidate(n: usize, nsfw: bool) -> CandidateItem {
        CandidateItem {
            download_url: format!("https://example.com/full/{}.png", n),
            website_url: format!("https://example.com/view/{}", n),
            title: Some(format!("Wallpaper {}", n)),
            author: None,
            author_url: None,
            nsfw,
            source_created_at: None,
            width: None,
            height: None,
        }
    }

    fn png_bytes(width: u32, height: u32) -> Bytes {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        Bytes::from(bytes)
    }

    struct Fixture {
        processor: ImageProcessor,
        images: Arc<SqlxImageRepository>,
        source: Source,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let sources = SqlxSourceRepository::new(pool.clone());
        let source = Source::new("wallpapers", "static", "{}");
        sources.create_source(&source).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let images = Arc::new(SqlxImageRepository::new(pool));
        let processor = ImageProcessor::new(
            images.clone(),
            dir.path().join("images"),
            dir.path().join("tmp"),
        );
        Fixture {
            processor,
            images,
            source,
            _dir: dir,
        }
    }

    fn portrait_device(slug: &str) -> Device {
        Device::new(slug, slug, 1080, 2400).with_aspect_tolerance(0.05)
    }

    #[tokio::test]
    async fn fan_out_creates_rows_and_files_for_every_device() {
        let fx = fixture().await;
        let devices = vec![portrait_device("phone"), portrait_device("spare")];

        let detail = fx
            .processor
            .process_image(
                png_bytes(1080, 2400),
                Some("image/png"),
                &png_candidate(1, false),
                &devices,
                &fx.source.id,
            )
            .await
            .unwrap();

        assert_eq!(detail.status, ItemStatus::Downloaded);
        assert_eq!(detail.device_slugs, vec!["phone", "spare"]);

        let image_id = detail.image_id.unwrap();
        let image = fx.images.get_image(&image_id).await.unwrap();
        assert_eq!(image.width, 1080);
        assert_eq!(image.format, "png");
        assert!(!image.checksum.is_empty());

        let placements = fx
            .images
            .list_device_images_for_image(&image_id)
            .await
            .unwrap();
        assert_eq!(placements.len(), 2);
        for placement in &placements {
            assert!(
                std::path::Path::new(&placement.local_path).exists(),
                "file missing at {}",
                placement.local_path
            );
            assert!(placement.local_path.ends_with(&format!("{}.png", image_id)));
        }

        // Staged file must be gone.
        assert_eq!(
            fx.processor.temp_dir.read_dir().map(|d| d.count()).unwrap_or(0),
            0
        );
    }

    #[tokio::test]
    async fn no_eligible_devices_is_a_skip() {
        let fx = fixture().await;
        let devices = vec![portrait_device("phone")];

        // Landscape image against a portrait-only device set.
        let detail = fx
            .processor
            .process_image(
                png_bytes(3840, 2160),
                Some("image/png"),
                &png_candidate(2, false),
                &devices,
                &fx.source.id,
            )
            .await
            .unwrap();

        assert_eq!(detail.status, ItemStatus::Skipped);
        assert_eq!(detail.message.as_deref(), Some(NO_ELIGIBLE_DEVICES));
        assert_eq!(fx.images.count_images().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undetectable_dimensions_fail_the_item() {
        let fx = fixture().await;
        let devices = vec![portrait_device("phone")];

        let err = fx
            .processor
            .process_image(
                Bytes::from_static(b"definitely not a png"),
                Some("image/png"),
                &png_candidate(3, false),
                &devices,
                &fx.source.id,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimensions"));
        assert_eq!(fx.images.count_images().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nsfw_is_refiltered_with_known_dimensions() {
        let fx = fixture().await;
        let devices = vec![portrait_device("phone")];

        let detail = fx
            .processor
            .process_image(
                png_bytes(1080, 2400),
                Some("image/png"),
                &png_candidate(4, true),
                &devices,
                &fx.source.id,
            )
            .await
            .unwrap();
        assert_eq!(detail.status, ItemStatus::Skipped);
    }

    #[tokio::test]
    async fn duplicate_download_url_unwinds_the_temp_file() {
        let fx = fixture().await;
        let devices = vec![portrait_device("phone")];
        let candidate = png_candidate(5, false);

        fx.processor
            .process_image(
                png_bytes(1080, 2400),
                Some("image/png"),
                &candidate,
                &devices,
                &fx.source.id,
            )
            .await
            .unwrap();

        let err = fx
            .processor
            .process_image(
                png_bytes(1080, 2400),
                Some("image/png"),
                &candidate,
                &devices,
                &fx.source.id,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Uniqueness(_)));

        // Exactly one image row survives and the temp dir is clean.
        assert_eq!(fx.images.count_images().await.unwrap(), 1);
        assert_eq!(
            fx.processor.temp_dir.read_dir().map(|d| d.count()).unwrap_or(0),
            0
        );
    }

    #[tokio::test]
    async fn batch_outcome_counts() {
        let mut outcome = BatchOutcome::default();
        outcome.record(ItemDetail::skipped("u1", "slow transfer aborted: x"));
        outcome.record(ItemDetail::failed("u2", "HTTP 404 Not Found"));
        outcome.record(ItemDetail::downloaded("u3", "id".into(), vec!["phone".into()]));
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.downloaded, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.failed, 1);
    }
}
