//! Source database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// An upstream content source configuration.
///
/// `kind` names the adapter that fetches from it; `params` is an opaque JSON
/// object whose shape the adapter defines.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub enabled: bool,
    /// Unique display name.
    pub name: String,
    /// Adapter tag, resolved through the adapter registry.
    pub kind: String,
    /// JSON blob of adapter-specific parameters.
    pub params: String,
    /// Upper bound on upstream items inspected per run.
    pub lookup_limit: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Source {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, params: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: super::new_id(),
            enabled: true,
            name: name.into(),
            kind: kind.into(),
            params: params.into(),
            lookup_limit: 200,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_lookup_limit(mut self, limit: i64) -> Self {
        self.lookup_limit = limit;
        self
    }

    /// Parse `params` as a JSON value.
    pub fn params_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.params)?)
    }

    /// Validate the structural invariants before persisting.
    ///
    /// Adapter-kind resolution and parameter validation happen against the
    /// registry at the admin surface.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("source name must not be empty"));
        }
        if self.kind.trim().is_empty() {
            return Err(Error::validation("source kind must not be empty"));
        }
        if self.lookup_limit <= 0 {
            return Err(Error::validation("lookup limit must be positive"));
        }
        serde_json::from_str::<serde_json::Value>(&self.params)
            .map_err(|e| Error::validation(format!("source params is not valid JSON: {}", e)))?;
        Ok(())
    }
}
