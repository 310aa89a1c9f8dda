//! Typed row models for every entity.

pub mod device;
pub mod image;
pub mod run;
pub mod schedule;
pub mod source;
pub mod subscription;

pub use device::{Device, NsfwPolicy};
pub use image::{DeviceImage, Image, NewImage};
pub use run::{Run, RunCounts, RunState, FETCH_SOURCE_JOB};
pub use schedule::Schedule;
pub use source::Source;
pub use subscription::Subscription;


/// Mint a new time-ordered entity id.
///
/// UUIDv7 sorts with creation time, which keeps the gallery cursor's id
/// tie-break stable.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
