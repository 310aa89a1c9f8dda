//! Image and device-image repository.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{DeviceImage, Image};
use crate::database::retry::retry_on_sqlite_busy;
use crate::error::map_unique_violation;
use crate::{Error, Result};

/// One page of the gallery, newest first.
#[derive(Debug, Clone)]
pub struct GalleryPage {
    pub images: Vec<Image>,
    /// Cursor for the next page (`"{epochMillis}_{id}"`), or `None` when the
    /// listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Parse a gallery cursor of the form `"{epochMillis}_{id}"`.
fn parse_cursor(cursor: &str) -> Result<(i64, String)> {
    let Some((ts, id)) = cursor.split_once('_') else {
        return Err(Error::validation(format!("invalid cursor '{}'", cursor)));
    };
    let ts: i64 = ts
        .parse()
        .map_err(|_| Error::validation(format!("invalid cursor '{}'", cursor)))?;
    if id.is_empty() {
        return Err(Error::validation(format!("invalid cursor '{}'", cursor)));
    }
    Ok((ts, id.to_string()))
}

/// Image repository trait.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn get_image(&self, id: &str) -> Result<Image>;
    async fn create_image(&self, image: &Image) -> Result<()>;
    async fn delete_image(&self, id: &str) -> Result<()>;

    /// Which of the given download URLs already have an image row.
    async fn filter_known_download_urls(&self, urls: &[String]) -> Result<HashSet<String>>;

    async fn create_device_image(&self, device_image: &DeviceImage) -> Result<()>;
    async fn delete_device_image(&self, id: &str) -> Result<()>;
    async fn list_device_images_for_image(&self, image_id: &str) -> Result<Vec<DeviceImage>>;
    async fn list_device_images_for_device(&self, device_id: &str) -> Result<Vec<DeviceImage>>;

    async fn count_images(&self) -> Result<u64>;
    async fn count_device_images(&self) -> Result<u64>;

    /// Page images by (created_at DESC, id DESC) from an optional cursor.
    async fn page_images(&self, cursor: Option<&str>, limit: u32) -> Result<GalleryPage>;
}

/// SQLx implementation of [`ImageRepository`].
pub struct SqlxImageRepository {
    pool: SqlitePool,
}

impl SqlxImageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageRepository for SqlxImageRepository {
    async fn get_image(&self, id: &str) -> Result<Image> {
        sqlx::query_as::<_, Image>("SELECT * FROM images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Image", id))
    }

    async fn create_image(&self, image: &Image) -> Result<()> {
        retry_on_sqlite_busy("create_image", || async {
            sqlx::query(
                r#"
                INSERT INTO images (
                    id, source_id, website_url, download_url, checksum,
                    width, height, aspect_ratio, filesize, format, nsfw,
                    title, author, author_url, source_created_at,
                    created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&image.id)
            .bind(&image.source_id)
            .bind(&image.website_url)
            .bind(&image.download_url)
            .bind(&image.checksum)
            .bind(image.width)
            .bind(image.height)
            .bind(image.aspect_ratio)
            .bind(image.filesize)
            .bind(&image.format)
            .bind(image.nsfw)
            .bind(&image.title)
            .bind(&image.author)
            .bind(&image.author_url)
            .bind(image.source_created_at)
            .bind(image.created_at)
            .bind(image.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique_violation(e, "an image with this download URL already exists")
            })?;
            Ok(())
        })
        .await
    }

    async fn delete_image(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_image", || async {
            sqlx::query("DELETE FROM images WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn filter_known_download_urls(&self, urls: &[String]) -> Result<HashSet<String>> {
        if urls.is_empty() {
            return Ok(HashSet::new());
        }

        let placeholders = urls.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT download_url FROM images WHERE download_url IN ({})",
            placeholders
        );

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for url in urls {
            query = query.bind(url);
        }

        let known = query.fetch_all(&self.pool).await?;
        Ok(known.into_iter().collect())
    }

    async fn create_device_image(&self, device_image: &DeviceImage) -> Result<()> {
        retry_on_sqlite_busy("create_device_image", || async {
            sqlx::query(
                r#"
                INSERT INTO device_images (id, device_id, image_id, local_path, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&device_image.id)
            .bind(&device_image.device_id)
            .bind(&device_image.image_id)
            .bind(&device_image.local_path)
            .bind(device_image.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "this image is already placed on this device"))?;
            Ok(())
        })
        .await
    }

    async fn delete_device_image(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_device_image", || async {
            sqlx::query("DELETE FROM device_images WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_device_images_for_image(&self, image_id: &str) -> Result<Vec<DeviceImage>> {
        let rows =
            sqlx::query_as::<_, DeviceImage>("SELECT * FROM device_images WHERE image_id = ?")
                .bind(image_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn list_device_images_for_device(&self, device_id: &str) -> Result<Vec<DeviceImage>> {
        let rows =
            sqlx::query_as::<_, DeviceImage>("SELECT * FROM device_images WHERE device_id = ?")
                .bind(device_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn count_images(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_device_images(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM device_images")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn page_images(&self, cursor: Option<&str>, limit: u32) -> Result<GalleryPage> {
        let images = match cursor {
            None => {
                sqlx::query_as::<_, Image>(
                    "SELECT * FROM images ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            Some(cursor) => {
                let (ts, id) = parse_cursor(cursor)?;
                sqlx::query_as::<_, Image>(
                    r#"
                    SELECT * FROM images
                    WHERE created_at < ? OR (created_at = ? AND id < ?)
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(ts)
                .bind(ts)
                .bind(id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let next_cursor = if images.len() == limit as usize {
            images
                .last()
                .map(|img| format!("{}_{}", img.created_at, img.id))
        } else {
            None
        };

        Ok(GalleryPage {
            images,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{NewImage, Source};
    use crate::database::repositories::source::{SourceRepository, SqlxSourceRepository};
    use crate::database::test_pool;

    fn new_image(source_id: &str, n: usize, created_at: i64) -> Image {
        let mut image = NewImage {
            source_id: source_id.to_string(),
            website_url: format!("https://example.com/view/{}", n),
            download_url: format!("https://example.com/full/{}.jpg", n),
            checksum: format!("checksum-{}", n),
            width: 1080,
            height: 2400,
            filesize: 1024,
            format: "jpeg".to_string(),
            nsfw: false,
            title: None,
            author: None,
            author_url: None,
            source_created_at: None,
        }
        .into_image();
        image.created_at = created_at;
        image
    }

    async fn seed_source(pool: &SqlitePool) -> Source {
        let sources = SqlxSourceRepository::new(pool.clone());
        let source = Source::new("wallpapers", "static", "{}");
        sources.create_source(&source).await.unwrap();
        source
    }

    #[tokio::test]
    async fn duplicate_download_url_is_a_uniqueness_error() {
        let pool = test_pool().await;
        let source = seed_source(&pool).await;
        let repo = SqlxImageRepository::new(pool);

        repo.create_image(&new_image(&source.id, 1, 1000))
            .await
            .unwrap();
        let err = repo
            .create_image(&new_image(&source.id, 1, 2000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Uniqueness(_)));
    }

    #[tokio::test]
    async fn known_download_urls_are_filtered() {
        let pool = test_pool().await;
        let source = seed_source(&pool).await;
        let repo = SqlxImageRepository::new(pool);

        repo.create_image(&new_image(&source.id, 1, 1000))
            .await
            .unwrap();
        repo.create_image(&new_image(&source.id, 2, 1000))
            .await
            .unwrap();

        let known = repo
            .filter_known_download_urls(&[
                "https://example.com/full/1.jpg".to_string(),
                "https://example.com/full/3.jpg".to_string(),
            ])
            .await
            .unwrap();
        assert!(known.contains("https://example.com/full/1.jpg"));
        assert!(!known.contains("https://example.com/full/3.jpg"));
    }

    #[tokio::test]
    async fn cursor_pages_are_disjoint_and_exhaustive() {
        let pool = test_pool().await;
        let source = seed_source(&pool).await;
        let repo = SqlxImageRepository::new(pool);

        // Two images share a created_at so the id tie-break is exercised.
        for (n, ts) in [(1usize, 1000i64), (2, 2000), (3, 2000), (4, 3000), (5, 4000)] {
            repo.create_image(&new_image(&source.id, n, ts)).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = repo.page_images(cursor.as_deref(), 2).await.unwrap();
            seen.extend(page.images.iter().map(|i| i.id.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 5, "pages must reconstruct the full list");
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 5, "pages must be disjoint");

        // Concatenated pages equal the full ordered listing.
        let full = repo.page_images(None, 100).await.unwrap();
        let full_ids: Vec<_> = full.images.iter().map(|i| i.id.clone()).collect();
        assert_eq!(seen, full_ids);
    }

    #[tokio::test]
    async fn malformed_cursor_is_rejected() {
        let pool = test_pool().await;
        let repo = SqlxImageRepository::new(pool);
        assert!(repo.page_images(Some("nonsense"), 10).await.is_err());
        assert!(repo.page_images(Some("123_"), 10).await.is_err());
    }
}
