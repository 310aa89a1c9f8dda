//! Device eligibility filtering.
//!
//! Pure functions deciding whether an image satisfies a device's
//! constraints. No I/O; repeated evaluation of the same inputs is identical.

use serde::{Deserialize, Serialize};

use crate::database::models::{Device, NsfwPolicy};

/// The image facts eligibility is decided on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageMeta {
    pub width: i64,
    pub height: i64,
    pub filesize: i64,
    pub nsfw: bool,
}

impl ImageMeta {
    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

/// Why a device rejected an image. Display strings are stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    DeviceDisabled,
    NsfwRejected,
    NsfwRequired,
    AspectRatioMismatch,
    WidthOutOfBounds,
    HeightOutOfBounds,
    FilesizeOutOfBounds,
}

/// Outcome of one eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    NotEligible(RejectionReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// Decide whether `meta` satisfies `device`'s constraints.
///
/// Checks run in a fixed order and the first failure wins: enabled flag,
/// NSFW policy, aspect ratio, dimension bounds, filesize bounds.
pub fn eligible(device: &Device, meta: &ImageMeta) -> Eligibility {
    use Eligibility::NotEligible;
    use RejectionReason::*;

    if !device.enabled {
        return NotEligible(DeviceDisabled);
    }

    match device.policy() {
        NsfwPolicy::AcceptAll => {}
        NsfwPolicy::RejectNsfw if meta.nsfw => return NotEligible(NsfwRejected),
        NsfwPolicy::RequireNsfw if !meta.nsfw => return NotEligible(NsfwRequired),
        _ => {}
    }

    if (device.aspect_ratio() - meta.aspect_ratio()).abs() > device.aspect_tolerance {
        return NotEligible(AspectRatioMismatch);
    }

    if device.min_width.is_some_and(|min| meta.width < min)
        || device.max_width.is_some_and(|max| meta.width > max)
    {
        return NotEligible(WidthOutOfBounds);
    }
    if device.min_height.is_some_and(|min| meta.height < min)
        || device.max_height.is_some_and(|max| meta.height > max)
    {
        return NotEligible(HeightOutOfBounds);
    }

    if device.min_filesize.is_some_and(|min| meta.filesize < min)
        || device.max_filesize.is_some_and(|max| meta.filesize > max)
    {
        return NotEligible(FilesizeOutOfBounds);
    }

    Eligibility::Eligible
}

/// The subset of `devices` for which [`eligible`] says yes.
pub fn find_eligible_devices<'a>(devices: &'a [Device], meta: &ImageMeta) -> Vec<&'a Device> {
    devices
        .iter()
        .filter(|device| eligible(device, meta).is_eligible())
        .collect()
}
