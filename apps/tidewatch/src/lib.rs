//! tidewatch: a sidecar that shares a worker's local resource bindings with an
//! inspector, proxies its traffic, and supervises the runtime hosting both.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod manifest;
pub mod sidecar;
pub mod supervisor;
pub mod synth;
pub mod telemetry;
