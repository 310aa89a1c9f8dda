//! Repositories: typed CRUD plus the specialised queries the core needs.

pub mod device;
pub mod image;
pub mod run;
pub mod schedule;
pub mod source;
pub mod subscription;

pub use device::{DeviceRepository, SqlxDeviceRepository};
pub use image::{GalleryPage, ImageRepository, SqlxImageRepository};
pub use run::{RunRepository, SqlxRunRepository};
pub use schedule::{ScheduleRepository, ScheduleWithSource, SqlxScheduleRepository};
pub use source::{SourceRepository, SqlxSourceRepository};
pub use subscription::{SqlxSubscriptionRepository, SubscriptionRepository};
