//! Device database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// How a device treats NSFW-flagged images.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NsfwPolicy {
    /// Accept every image regardless of flag.
    AcceptAll,
    /// Reject images flagged NSFW.
    RejectNsfw,
    /// Accept only images flagged NSFW.
    RequireNsfw,
}

impl NsfwPolicy {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::AcceptAll => 0,
            Self::RejectNsfw => 1,
            Self::RequireNsfw => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::AcceptAll),
            1 => Some(Self::RejectNsfw),
            2 => Some(Self::RequireNsfw),
            _ => None,
        }
    }
}

/// A consumer device profile.
///
/// Images are materialised into `{image_dir}/{slug}/` when they satisfy the
/// device's constraints.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub enabled: bool,
    pub name: String,
    /// URL-safe identifier, unique across devices; doubles as the directory name.
    pub slug: String,
    /// Native width in pixels.
    pub width: i64,
    /// Native height in pixels.
    pub height: i64,
    /// Maximum |device ratio - image ratio| accepted.
    pub aspect_tolerance: f64,
    pub min_width: Option<i64>,
    pub max_width: Option<i64>,
    pub min_height: Option<i64>,
    pub max_height: Option<i64>,
    pub min_filesize: Option<i64>,
    pub max_filesize: Option<i64>,
    /// Stored as 0/1/2, see [`NsfwPolicy`].
    pub nsfw_policy: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Device {
    pub fn new(name: impl Into<String>, slug: impl Into<String>, width: i64, height: i64) -> Self {
        let now = now_ms();
        Self {
            id: super::new_id(),
            enabled: true,
            name: name.into(),
            slug: slug.into(),
            width,
            height,
            aspect_tolerance: 0.1,
            min_width: None,
            max_width: None,
            min_height: None,
            max_height: None,
            min_filesize: None,
            max_filesize: None,
            nsfw_policy: NsfwPolicy::RejectNsfw.as_i64(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The device's NSFW policy; unknown stored values fall back to reject.
    pub fn policy(&self) -> NsfwPolicy {
        NsfwPolicy::from_i64(self.nsfw_policy).unwrap_or(NsfwPolicy::RejectNsfw)
    }

    pub fn with_policy(mut self, policy: NsfwPolicy) -> Self {
        self.nsfw_policy = policy.as_i64();
        self
    }

    pub fn with_aspect_tolerance(mut self, tolerance: f64) -> Self {
        self.aspect_tolerance = tolerance;
        self
    }

    /// Native aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    /// Validate the structural invariants before persisting.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("device name must not be empty"));
        }
        if self.slug.is_empty()
            || !self
                .slug
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::validation(
                "device slug must be non-empty and contain only letters, digits, '-' or '_'",
            ));
        }
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::validation("device dimensions must be positive"));
        }
        if self.aspect_tolerance < 0.0 {
            return Err(Error::validation("aspect tolerance must not be negative"));
        }
        if NsfwPolicy::from_i64(self.nsfw_policy).is_none() {
            return Err(Error::validation("unknown NSFW policy value"));
        }

        for (label, min, max) in [
            ("width", self.min_width, self.max_width),
            ("height", self.min_height, self.max_height),
            ("filesize", self.min_filesize, self.max_filesize),
        ] {
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    return Err(Error::validation(format!(
                        "min {} must not exceed max {}",
                        label, label
                    )));
                }
            }
        }

        Ok(())
    }
}
