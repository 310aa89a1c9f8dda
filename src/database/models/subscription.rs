//! Subscription database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// A device's declaration that it wants images from a source.
/// Keyed by (device_id, source_id).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub device_id: String,
    pub source_id: String,
    pub enabled: bool,
    pub created_at: i64,
}

impl Subscription {
    pub fn new(device_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            source_id: source_id.into(),
            enabled: true,
            created_at: now_ms(),
        }
    }
}
