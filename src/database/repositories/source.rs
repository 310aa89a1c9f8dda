//! Source repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::Source;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::error::map_unique_violation;
use crate::{Error, Result};

/// Source repository trait.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn get_source(&self, id: &str) -> Result<Source>;
    async fn list_sources(&self) -> Result<Vec<Source>>;
    async fn create_source(&self, source: &Source) -> Result<()>;
    async fn update_source(&self, source: &Source) -> Result<()>;
    async fn delete_source(&self, id: &str) -> Result<()>;
    async fn count_sources(&self) -> Result<u64>;
}

/// SQLx implementation of [`SourceRepository`].
pub struct SqlxSourceRepository {
    pool: SqlitePool,
}

impl SqlxSourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceRepository for SqlxSourceRepository {
    async fn get_source(&self, id: &str) -> Result<Source> {
        sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Source", id))
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>("SELECT * FROM sources ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    async fn create_source(&self, source: &Source) -> Result<()> {
        retry_on_sqlite_busy("create_source", || async {
            sqlx::query(
                r#"
                INSERT INTO sources (
                    id, enabled, name, kind, params, lookup_limit, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&source.id)
            .bind(source.enabled)
            .bind(&source.name)
            .bind(&source.kind)
            .bind(&source.params)
            .bind(source.lookup_limit)
            .bind(source.created_at)
            .bind(source.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "a source with this name already exists"))?;
            Ok(())
        })
        .await
    }

    async fn update_source(&self, source: &Source) -> Result<()> {
        retry_on_sqlite_busy("update_source", || async {
            let res = sqlx::query(
                r#"
                UPDATE sources SET
                    enabled = ?, name = ?, kind = ?, params = ?,
                    lookup_limit = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(source.enabled)
            .bind(&source.name)
            .bind(&source.kind)
            .bind(&source.params)
            .bind(source.lookup_limit)
            .bind(now_ms())
            .bind(&source.id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "a source with this name already exists"))?;

            if res.rows_affected() == 0 {
                return Err(Error::not_found("Source", &source.id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_source(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_source", || async {
            let res = sqlx::query("DELETE FROM sources WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if res.rows_affected() == 0 {
                return Err(Error::not_found("Source", id));
            }
            Ok(())
        })
        .await
    }

    async fn count_sources(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
