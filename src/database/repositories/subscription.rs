//! Subscription repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{Device, Subscription};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Subscription repository trait.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Insert or replace the (device, source) association.
    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn delete_subscription(&self, device_id: &str, source_id: &str) -> Result<()>;
    async fn list_subscriptions_for_source(&self, source_id: &str) -> Result<Vec<Subscription>>;
    async fn list_subscriptions_for_device(&self, device_id: &str) -> Result<Vec<Subscription>>;
    /// Enabled devices with an enabled subscription to the source.
    async fn list_subscribed_devices(&self, source_id: &str) -> Result<Vec<Device>>;
}

/// SQLx implementation of [`SubscriptionRepository`].
pub struct SqlxSubscriptionRepository {
    pool: SqlitePool,
}

impl SqlxSubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepository for SqlxSubscriptionRepository {
    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        retry_on_sqlite_busy("upsert_subscription", || async {
            sqlx::query(
                r#"
                INSERT INTO subscriptions (device_id, source_id, enabled, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(device_id, source_id) DO UPDATE SET enabled = excluded.enabled
                "#,
            )
            .bind(&subscription.device_id)
            .bind(&subscription.source_id)
            .bind(subscription.enabled)
            .bind(subscription.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete_subscription(&self, device_id: &str, source_id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_subscription", || async {
            let res =
                sqlx::query("DELETE FROM subscriptions WHERE device_id = ? AND source_id = ?")
                    .bind(device_id)
                    .bind(source_id)
                    .execute(&self.pool)
                    .await?;
            if res.rows_affected() == 0 {
                return Err(Error::not_found(
                    "Subscription",
                    format!("{}/{}", device_id, source_id),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn list_subscriptions_for_source(&self, source_id: &str) -> Result<Vec<Subscription>> {
        let rows =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn list_subscriptions_for_device(&self, device_id: &str) -> Result<Vec<Subscription>> {
        let rows =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE device_id = ?")
                .bind(device_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn list_subscribed_devices(&self, source_id: &str) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            r#"
            SELECT d.*
            FROM devices d
            JOIN subscriptions sub ON sub.device_id = d.id
            WHERE sub.source_id = ? AND sub.enabled = 1 AND d.enabled = 1
            ORDER BY d.name
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Source;
    use crate::database::repositories::device::{DeviceRepository, SqlxDeviceRepository};
    use crate::database::repositories::source::{SourceRepository, SqlxSourceRepository};
    use crate::database::test_pool;

    #[tokio::test]
    async fn subscribed_devices_filters_disabled() {
        let pool = test_pool().await;
        let devices = SqlxDeviceRepository::new(pool.clone());
        let sources = SqlxSourceRepository::new(pool.clone());
        let subs = SqlxSubscriptionRepository::new(pool.clone());

        let source = Source::new("wallpapers", "static", "{}");
        sources.create_source(&source).await.unwrap();

        let phone = Device::new("Phone", "phone", 1080, 2400);
        let mut tablet = Device::new("Tablet", "tablet", 1600, 2560);
        tablet.enabled = false;
        let desktop = Device::new("Desktop", "desktop", 3840, 2160);
        for d in [&phone, &tablet, &desktop] {
            devices.create_device(d).await.unwrap();
        }

        subs.upsert_subscription(&Subscription::new(&phone.id, &source.id))
            .await
            .unwrap();
        subs.upsert_subscription(&Subscription::new(&tablet.id, &source.id))
            .await
            .unwrap();
        let mut disabled_sub = Subscription::new(&desktop.id, &source.id);
        disabled_sub.enabled = false;
        subs.upsert_subscription(&disabled_sub).await.unwrap();

        let eligible = subs.list_subscribed_devices(&source.id).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].slug, "phone");
    }
}
