//! Image and device-image database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Canonical record of a discovered asset. `download_url` is globally unique
/// and is the dedup key across runs.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub source_id: Option<String>,
    pub website_url: String,
    pub download_url: String,
    /// Hex MD5 of the file contents.
    pub checksum: String,
    pub width: i64,
    pub height: i64,
    /// width / height.
    pub aspect_ratio: f64,
    pub filesize: i64,
    /// Detected format tag ("jpeg", "png", "gif", "webp").
    pub format: String,
    /// 0/1 flag from the upstream item.
    pub nsfw: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub source_created_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Everything needed to insert a new image row.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub source_id: String,
    pub website_url: String,
    pub download_url: String,
    pub checksum: String,
    pub width: i64,
    pub height: i64,
    pub filesize: i64,
    pub format: String,
    pub nsfw: bool,
    pub title: Option<String>,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub source_created_at: Option<i64>,
}

impl NewImage {
    /// Materialise an [`Image`] row with a fresh id and timestamps.
    pub fn into_image(self) -> Image {
        let now = now_ms();
        Image {
            id: super::new_id(),
            source_id: Some(self.source_id),
            website_url: self.website_url,
            download_url: self.download_url,
            checksum: self.checksum,
            width: self.width,
            height: self.height,
            aspect_ratio: self.width as f64 / self.height as f64,
            filesize: self.filesize,
            format: self.format,
            nsfw: i64::from(self.nsfw),
            title: self.title,
            author: self.author,
            author_url: self.author_url,
            source_created_at: self.source_created_at,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A materialisation of an image onto one device. The row is the
/// authoritative index of the file at `local_path`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeviceImage {
    pub id: String,
    pub device_id: Option<String>,
    pub image_id: Option<String>,
    pub local_path: String,
    pub created_at: i64,
}

impl DeviceImage {
    pub fn new(
        device_id: impl Into<String>,
        image_id: impl Into<String>,
        local_path: impl Into<String>,
    ) -> Self {
        Self {
            id: super::new_id(),
            device_id: Some(device_id.into()),
            image_id: Some(image_id.into()),
            local_path: local_path.into(),
            created_at: now_ms(),
        }
    }
}
