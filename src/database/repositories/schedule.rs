//! Schedule repository.

use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

use crate::database::models::Schedule;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// A schedule joined with the enabled flag of its source, as loaded by the
/// cron scheduler in one query.
#[derive(Debug, Clone, FromRow)]
pub struct ScheduleWithSource {
    pub id: String,
    pub source_id: String,
    pub cron_expression: String,
    pub source_enabled: bool,
}

/// Schedule repository trait.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn get_schedule(&self, id: &str) -> Result<Schedule>;
    async fn list_schedules(&self) -> Result<Vec<Schedule>>;
    async fn list_schedules_for_source(&self, source_id: &str) -> Result<Vec<Schedule>>;
    /// All schedules joined with their source's enabled flag.
    async fn list_schedules_with_source(&self) -> Result<Vec<ScheduleWithSource>>;
    async fn create_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn update_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn delete_schedule(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of [`ScheduleRepository`].
pub struct SqlxScheduleRepository {
    pool: SqlitePool,
}

impl SqlxScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleRepository for SqlxScheduleRepository {
    async fn get_schedule(&self, id: &str) -> Result<Schedule> {
        sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Schedule", id))
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(schedules)
    }

    async fn list_schedules_for_source(&self, source_id: &str) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM schedules WHERE source_id = ? ORDER BY created_at",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn list_schedules_with_source(&self) -> Result<Vec<ScheduleWithSource>> {
        let rows = sqlx::query_as::<_, ScheduleWithSource>(
            r#"
            SELECT s.id, s.source_id, s.cron_expression, src.enabled AS source_enabled
            FROM schedules s
            JOIN sources src ON src.id = s.source_id
            ORDER BY s.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create_schedule(&self, schedule: &Schedule) -> Result<()> {
        retry_on_sqlite_busy("create_schedule", || async {
            sqlx::query(
                r#"
                INSERT INTO schedules (id, source_id, cron_expression, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&schedule.id)
            .bind(&schedule.source_id)
            .bind(&schedule.cron_expression)
            .bind(schedule.created_at)
            .bind(schedule.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        retry_on_sqlite_busy("update_schedule", || async {
            let res = sqlx::query(
                "UPDATE schedules SET source_id = ?, cron_expression = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&schedule.source_id)
            .bind(&schedule.cron_expression)
            .bind(now_ms())
            .bind(&schedule.id)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 {
                return Err(Error::not_found("Schedule", &schedule.id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_schedule(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_schedule", || async {
            let res = sqlx::query("DELETE FROM schedules WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if res.rows_affected() == 0 {
                return Err(Error::not_found("Schedule", id));
            }
            Ok(())
        })
        .await
    }
}
