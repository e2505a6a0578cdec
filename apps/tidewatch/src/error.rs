use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::manifest::ManifestError;
use crate::supervisor::SupervisorError;
use crate::synth::SynthError;
use crate::telemetry::logging::InitError;

/// Failures that end a run before or while the runtime is supervised.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Synth(#[from] SynthError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("failed to build the proxy client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to bind inspector port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// One actionable suggestion printed under the error line.
    pub fn hint(&self) -> &'static str {
        match self {
            CliError::Config(err) => err.hint(),
            CliError::Manifest(err) => err.hint(),
            CliError::Synth(err) => err.hint(),
            CliError::Supervisor(err) => err.hint(),
            CliError::Logging(_) => "check that --log-file points at a writable location",
            CliError::HttpClient(_) => "re-run with --log-level debug for details",
            CliError::Bind { .. } => "another process is using that port; pass --port to pick another",
            CliError::Io(_) => "re-run with --log-level debug for details",
        }
    }
}
