use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ReadinessStrategy;
use crate::telemetry::logging::{LogConfig, LogLevel};

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_RUNTIME: &str = "npx wrangler";
pub const DEFAULT_DEV_DASHBOARD: &str = "http://localhost:5173";

#[derive(Parser, Debug)]
#[command(
    name = "tidewatch",
    about = "🌊 Inspect the resources bound to a local worker without touching its code",
    author,
    version,
    args_conflicts_with_subcommands = true,
    after_help = "Arguments after `--` are passed to the runtime verbatim."
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Everything after the first `--`, forwarded to the runtime untouched.
    #[arg(skip)]
    pub passthrough: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start only the inspector companion; run your own `wrangler dev` with the same --persist-to
    Attach(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(
        value_name = "MANIFEST",
        help = "Path to the worker manifest (searched upward from the current directory when omitted)"
    )]
    pub manifest: Option<PathBuf>,

    #[arg(
        long,
        short = 'p',
        env = "TIDEWATCH_PORT",
        default_value_t = DEFAULT_PORT,
        help = "Port the inspector and proxied worker are served on"
    )]
    pub port: u16,

    #[arg(
        long = "runtime-port",
        env = "TIDEWATCH_RUNTIME_PORT",
        value_name = "PORT",
        help = "Loopback port handed to the runtime (defaults to --port + 1)"
    )]
    pub runtime_port: Option<u16>,

    #[arg(
        long = "persist-to",
        env = "TIDEWATCH_PERSIST_TO",
        value_name = "PATH",
        help = "Shared state directory (defaults to <project>/.wrangler/state)"
    )]
    pub persist_to: Option<PathBuf>,

    #[arg(
        long = "work-dir",
        env = "TIDEWATCH_WORK_DIR",
        value_name = "PATH",
        help = "Where the companion manifest is written (defaults to <project>/.tidewatch)"
    )]
    pub work_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "TIDEWATCH_RUNTIME",
        value_name = "COMMAND",
        default_value = DEFAULT_RUNTIME,
        help = "Command that launches the host runtime"
    )]
    pub runtime: String,

    #[arg(
        long,
        value_enum,
        env = "TIDEWATCH_READINESS",
        default_value_t = ReadinessStrategy::Auto,
        help = "How runtime readiness is detected"
    )]
    pub readiness: ReadinessStrategy,

    #[arg(long = "no-open", env = "TIDEWATCH_NO_OPEN", help = "Do not open the dashboard in a browser")]
    pub no_open: bool,

    #[arg(long = "no-tui", env = "TIDEWATCH_NO_TUI", help = "Use plain console output instead of the terminal UI")]
    pub no_tui: bool,

    #[arg(long, help = "Point the browser at a locally served dashboard build")]
    pub dev: bool,

    #[arg(
        long = "dev-url",
        env = "TIDEWATCH_DEV_URL",
        value_name = "URL",
        default_value = DEFAULT_DEV_DASHBOARD,
        help = "Dashboard dev server used with --dev"
    )]
    pub dev_url: String,

    #[arg(long, short = 'v', help = "Show runtime output tidewatch normally filters out")]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "TIDEWATCH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Level for tidewatch's own diagnostics"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "TIDEWATCH_LOG_FILE",
        help = "Append diagnostics to PATH instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    /// `verbose` raises the default level to debug; an explicit louder level wins.
    pub fn to_config(&self, verbose: bool, console: bool) -> LogConfig {
        let level = if verbose {
            self.level.max(LogLevel::Debug)
        } else {
            self.level
        };
        LogConfig {
            level,
            file: self.file.clone(),
            console,
        }
    }
}

impl Cli {
    /// Parses the process arguments, exiting with clap's usage error on failure.
    pub fn parse_args() -> Self {
        match Self::try_parse_from_args(std::env::args_os()) {
            Ok(cli) => cli,
            Err(err) => err.exit(),
        }
    }

    /// Splits off the passthrough tail at the first `--` before handing the
    /// rest to clap.
    pub fn try_parse_from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut own: Vec<OsString> = Vec::new();
        let mut passthrough: Vec<String> = Vec::new();
        let mut iter = args.into_iter().map(Into::into);
        for arg in iter.by_ref() {
            if arg == "--" {
                break;
            }
            own.push(arg);
        }
        passthrough.extend(iter.map(|arg| arg.to_string_lossy().into_owned()));

        let mut cli = Self::try_parse_from(own)?;
        cli.passthrough = passthrough;
        Ok(cli)
    }

    pub fn is_attach(&self) -> bool {
        matches!(self.command, Some(Command::Attach(_)))
    }

    pub fn run_args(&self) -> &RunArgs {
        match &self.command {
            Some(Command::Attach(args)) => args,
            None => &self.run,
        }
    }
}
