//! fallpaper — self-hosted wallpaper collection service.
//!
//! Cron schedules materialise pending runs in SQLite; the run processor
//! claims due runs and executes them; each run pages candidate images out of
//! a source adapter, filters them against subscribed devices, downloads the
//! survivors and fans matching files out into per-device directories.

pub mod admin;
pub mod config;
pub mod database;
pub mod downloader;
pub mod eligibility;
pub mod error;
pub mod logging;
pub mod processor;
pub mod runner;
pub mod scheduler;
pub mod sources;
pub mod utils;

pub use error::{Error, Result};
