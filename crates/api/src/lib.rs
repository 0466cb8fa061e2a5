//! HTTP API: job submission and inspection over the shared job store.

pub mod app;
