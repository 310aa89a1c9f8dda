//! Schedule database model.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// A cron binding: every fire inserts one pending run for the source.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub source_id: String,
    /// 6-field cron expression (seconds first).
    pub cron_expression: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Schedule {
    pub fn new(source_id: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: super::new_id(),
            source_id: source_id.into(),
            cron_expression: cron_expression.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Parse the cron expression.
    pub fn cron_schedule(&self) -> Result<cron::Schedule> {
        cron::Schedule::from_str(&self.cron_expression).map_err(|e| {
            Error::validation(format!(
                "invalid cron expression '{}': {}",
                self.cron_expression, e
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.cron_schedule().map(|_| ())
    }
}
