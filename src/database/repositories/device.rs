//! Device repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::Device;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::error::map_unique_violation;
use crate::{Error, Result};

/// Device repository trait.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get_device(&self, id: &str) -> Result<Device>;
    async fn get_device_by_slug(&self, slug: &str) -> Result<Option<Device>>;
    async fn list_devices(&self) -> Result<Vec<Device>>;
    async fn create_device(&self, device: &Device) -> Result<()>;
    async fn update_device(&self, device: &Device) -> Result<()>;
    async fn delete_device(&self, id: &str) -> Result<()>;
    async fn count_devices(&self) -> Result<u64>;
}

/// SQLx implementation of [`DeviceRepository`].
pub struct SqlxDeviceRepository {
    pool: SqlitePool,
}

impl SqlxDeviceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRepository for SqlxDeviceRepository {
    async fn get_device(&self, id: &str) -> Result<Device> {
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Device", id))
    }

    async fn get_device_by_slug(&self, slug: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    async fn create_device(&self, device: &Device) -> Result<()> {
        retry_on_sqlite_busy("create_device", || async {
            sqlx::query(
                r#"
                INSERT INTO devices (
                    id, enabled, name, slug, width, height, aspect_tolerance,
                    min_width, max_width, min_height, max_height,
                    min_filesize, max_filesize, nsfw_policy, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&device.id)
            .bind(device.enabled)
            .bind(&device.name)
            .bind(&device.slug)
            .bind(device.width)
            .bind(device.height)
            .bind(device.aspect_tolerance)
            .bind(device.min_width)
            .bind(device.max_width)
            .bind(device.min_height)
            .bind(device.max_height)
            .bind(device.min_filesize)
            .bind(device.max_filesize)
            .bind(device.nsfw_policy)
            .bind(device.created_at)
            .bind(device.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "a device with this slug already exists"))?;
            Ok(())
        })
        .await
    }

    async fn update_device(&self, device: &Device) -> Result<()> {
        retry_on_sqlite_busy("update_device", || async {
            let res = sqlx::query(
                r#"
                UPDATE devices SET
                    enabled = ?, name = ?, slug = ?, width = ?, height = ?,
                    aspect_tolerance = ?, min_width = ?, max_width = ?,
                    min_height = ?, max_height = ?, min_filesize = ?,
                    max_filesize = ?, nsfw_policy = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(device.enabled)
            .bind(&device.name)
            .bind(&device.slug)
            .bind(device.width)
            .bind(device.height)
            .bind(device.aspect_tolerance)
            .bind(device.min_width)
            .bind(device.max_width)
            .bind(device.min_height)
            .bind(device.max_height)
            .bind(device.min_filesize)
            .bind(device.max_filesize)
            .bind(device.nsfw_policy)
            .bind(now_ms())
            .bind(&device.id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "a device with this slug already exists"))?;

            if res.rows_affected() == 0 {
                return Err(Error::not_found("Device", &device.id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_device", || async {
            let res = sqlx::query("DELETE FROM devices WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if res.rows_affected() == 0 {
                return Err(Error::not_found("Device", id));
            }
            Ok(())
        })
        .await
    }

    async fn count_devices(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
