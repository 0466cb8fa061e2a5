//! Infrastructure layer: job stores, worker runtime, config, DB bootstrap.

pub mod config;
pub mod db;
pub mod jobs;

pub use config::{ConfigError, QueueConfig};
