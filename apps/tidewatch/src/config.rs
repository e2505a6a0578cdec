use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;
use url::Url;

use crate::cli::RunArgs;
use crate::manifest::{self, ManifestError};
use crate::sidecar::INSPECTOR_PREFIX;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// One runtime hosts the companion and the user worker.
    Primary,
    /// Only the companion is launched; the user runs their worker separately.
    Attach,
}

impl LaunchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchMode::Primary => "primary",
            LaunchMode::Attach => "attach",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReadinessStrategy {
    /// Watch runtime stdout for a readiness phrase.
    Pattern,
    /// Poll the runtime port over loopback.
    Probe,
    /// Whichever of the two fires first.
    Auto,
}

impl ReadinessStrategy {
    pub fn watches_output(self) -> bool {
        matches!(self, ReadinessStrategy::Pattern | ReadinessStrategy::Auto)
    }

    pub fn probes(self) -> bool {
        matches!(self, ReadinessStrategy::Probe | ReadinessStrategy::Auto)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("--port must be nonzero")]
    ZeroPort,
    #[error("no runtime port available above {0}; pass --runtime-port")]
    NoRuntimePort(u16),
    #[error("--port and --runtime-port must differ (both {0})")]
    PortClash(u16),
    #[error("runtime command is empty")]
    EmptyRuntime,
    #[error("invalid url '{url}': {source}")]
    InvalidUrl { url: String, source: url::ParseError },
}

impl ConfigError {
    pub fn hint(&self) -> &'static str {
        match self {
            ConfigError::Manifest(err) => err.hint(),
            ConfigError::ZeroPort | ConfigError::NoRuntimePort(_) | ConfigError::PortClash(_) => {
                "pick a free --port, or set --runtime-port explicitly"
            }
            ConfigError::EmptyRuntime => "set --runtime (or TIDEWATCH_RUNTIME) to e.g. `npx wrangler`",
            ConfigError::InvalidUrl { .. } => "pass an absolute http(s) URL to --dev-url",
        }
    }
}

/// Validated settings for one supervised run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub mode: LaunchMode,
    pub manifest_path: PathBuf,
    pub port: u16,
    pub runtime_port: u16,
    pub persist_to: PathBuf,
    pub work_dir: PathBuf,
    pub runtime_program: String,
    pub runtime_args: Vec<String>,
    pub readiness: ReadinessStrategy,
    pub open_browser: bool,
    pub use_tui: bool,
    pub verbose: bool,
    pub stop_grace: Duration,
    pub passthrough: Vec<String>,
    dashboard_url: Url,
    runtime_url: Url,
}

impl SupervisorConfig {
    /// Resolves defaults relative to the manifest's project directory.
    /// `interactive` reports whether stdin and stdout are both terminals.
    pub fn from_args(
        args: &RunArgs,
        passthrough: Vec<String>,
        mode: LaunchMode,
        cwd: &Path,
        interactive: bool,
    ) -> Result<Self, ConfigError> {
        if args.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        let runtime_port = match args.runtime_port {
            Some(port) => port,
            None => args
                .port
                .checked_add(1)
                .ok_or(ConfigError::NoRuntimePort(args.port))?,
        };
        if runtime_port == args.port {
            return Err(ConfigError::PortClash(args.port));
        }

        let manifest_path = match &args.manifest {
            Some(path) => absolutize(cwd, path),
            None => manifest::discover(cwd)?,
        };
        let project_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());

        let mut words = args.runtime.split_whitespace().map(str::to_owned);
        let runtime_program = words.next().ok_or(ConfigError::EmptyRuntime)?;
        let runtime_args = words.collect();

        let dashboard_url = dashboard_url(args.port, args.dev.then_some(args.dev_url.as_str()))?;
        let runtime_url = parse_url(format!("http://127.0.0.1:{runtime_port}/"))?;

        Ok(Self {
            mode,
            manifest_path,
            port: args.port,
            runtime_port,
            persist_to: args
                .persist_to
                .as_deref()
                .map(|path| absolutize(cwd, path))
                .unwrap_or_else(|| project_dir.join(".wrangler").join("state")),
            work_dir: args
                .work_dir
                .as_deref()
                .map(|path| absolutize(cwd, path))
                .unwrap_or_else(|| project_dir.join(".tidewatch")),
            runtime_program,
            runtime_args,
            readiness: args.readiness,
            open_browser: !args.no_open,
            use_tui: interactive && !args.no_tui,
            verbose: args.verbose,
            stop_grace: DEFAULT_STOP_GRACE,
            passthrough,
            dashboard_url,
            runtime_url,
        })
    }

    pub fn dashboard_url(&self) -> &Url {
        &self.dashboard_url
    }

    /// Loopback address the runtime serves on; the proxy forwards here.
    pub fn runtime_url(&self) -> &Url {
        &self.runtime_url
    }
}

/// `http://localhost:<port>/__tidewatch/`, or the dev dashboard with the
/// sidecar port as a query parameter.
pub fn dashboard_url(port: u16, dev_dashboard: Option<&str>) -> Result<Url, ConfigError> {
    let raw = match dev_dashboard {
        Some(base) => base.to_owned(),
        None => format!("http://localhost:{port}{INSPECTOR_PREFIX}/"),
    };
    let mut url = parse_url(raw)?;
    if dev_dashboard.is_some() {
        url.query_pairs_mut().append_pair("port", &port.to_string());
    }
    Ok(url)
}

fn parse_url(raw: String) -> Result<Url, ConfigError> {
    Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { url: raw, source })
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use serial_test::serial;
    use std::fs;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["tidewatch"];
        argv.extend_from_slice(extra);
        Cli::try_parse_from_args(argv).unwrap().run_args().clone()
    }

    #[test]
    #[serial]
    fn defaults_resolve_against_discovered_project() {
        let project = tempfile::tempdir().unwrap();
        fs::write(project.path().join("wrangler.toml"), "name = \"app\"\n").unwrap();
        let nested = project.path().join("src").join("handlers");
        fs::create_dir_all(&nested).unwrap();

        let config =
            SupervisorConfig::from_args(&run_args(&[]), Vec::new(), LaunchMode::Primary, &nested, false)
                .unwrap();
        assert_eq!(config.manifest_path, project.path().join("wrangler.toml"));
        assert_eq!(config.runtime_port, 8788);
        assert_eq!(config.persist_to, project.path().join(".wrangler/state"));
        assert_eq!(config.work_dir, project.path().join(".tidewatch"));
        assert_eq!(config.runtime_program, "npx");
        assert_eq!(config.runtime_args, vec!["wrangler"]);
        assert!(!config.use_tui);
        assert!(config.open_browser);
        assert_eq!(config.dashboard_url().as_str(), "http://localhost:8787/__tidewatch/");
        assert_eq!(config.runtime_url().as_str(), "http://127.0.0.1:8788/");
    }

    #[test]
    #[serial]
    fn explicit_paths_are_resolved_from_cwd() {
        let cwd = tempfile::tempdir().unwrap();
        let args = run_args(&[
            "conf/wrangler.toml",
            "--persist-to",
            "/var/tmp/state",
            "--work-dir",
            "out",
            "--runtime-port",
            "9999",
            "--no-tui",
        ]);
        let config =
            SupervisorConfig::from_args(&args, Vec::new(), LaunchMode::Attach, cwd.path(), true).unwrap();
        assert_eq!(config.manifest_path, cwd.path().join("conf/wrangler.toml"));
        assert_eq!(config.persist_to, PathBuf::from("/var/tmp/state"));
        assert_eq!(config.work_dir, cwd.path().join("out"));
        assert_eq!(config.runtime_port, 9999);
        assert!(!config.use_tui);
        assert_eq!(config.mode.as_str(), "attach");
    }

    #[test]
    #[serial]
    fn env_overrides_port() {
        std::env::set_var("TIDEWATCH_PORT", "9300");
        let args = run_args(&["wrangler.toml"]);
        std::env::remove_var("TIDEWATCH_PORT");
        assert_eq!(args.port, 9300);
    }

    #[test]
    #[serial]
    fn rejects_port_without_room_for_runtime() {
        let args = run_args(&["wrangler.toml", "--port", "65535"]);
        let err = SupervisorConfig::from_args(&args, Vec::new(), LaunchMode::Primary, Path::new("/"), false)
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoRuntimePort(65535)));

        let args = run_args(&["wrangler.toml", "--port", "9000", "--runtime-port", "9000"]);
        let err = SupervisorConfig::from_args(&args, Vec::new(), LaunchMode::Primary, Path::new("/"), false)
            .unwrap_err();
        assert!(matches!(err, ConfigError::PortClash(9000)));
    }

    #[test]
    fn dev_dashboard_carries_the_port() {
        let url = dashboard_url(8787, Some("http://localhost:5173")).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5173/?port=8787");
        assert!(dashboard_url(8787, Some("not a url")).is_err());
    }

    #[test]
    fn readiness_strategies() {
        assert!(ReadinessStrategy::Auto.watches_output() && ReadinessStrategy::Auto.probes());
        assert!(!ReadinessStrategy::Pattern.probes());
        assert!(!ReadinessStrategy::Probe.watches_output());
    }
}
