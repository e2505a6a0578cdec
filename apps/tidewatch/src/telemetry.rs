pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

/// Process-wide `tracing` setup for the tidewatch binary.
///
/// Diagnostics meant for the operator go to the capture stores; this is the
/// developer-facing log stream.
pub mod logging {
    use std::fs::OpenOptions;
    use std::io;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter};

    /// Filter overrides, checked in order before `--log-level` applies.
    const FILTER_VARS: [&str; 2] = ["TIDEWATCH_LOG_FILTER", "RUST_LOG"];
    const NOISY_DEPS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2", "mio"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Write to stderr when no file is set. Off while the terminal UI owns the screen.
        pub console: bool,
    }

    impl Default for LogConfig {
        fn default() -> Self {
            Self {
                level: LogLevel::default(),
                file: None,
                console: true,
            }
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Sink {
        File(PathBuf),
        Stderr,
        Discard,
    }

    impl LogConfig {
        fn sink(&self) -> Sink {
            match (&self.file, self.console) {
                (Some(path), _) => Sink::File(path.clone()),
                (None, true) => Sink::Stderr,
                (None, false) => Sink::Discard,
            }
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        Io { path: PathBuf, source: io::Error },
        #[error("a global tracing subscriber is already installed: {0}")]
        Configure(String),
    }

    /// Holds the appender guard so buffered lines flush at exit. Set once.
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let sink = config.sink();
        let ansi = sink == Sink::Stderr;
        let (writer, guard) = open_writer(sink)?;
        let verbose = config.level >= LogLevel::Debug;

        tracing_subscriber::registry()
            .with(build_env_filter(config.level.into()))
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(verbose)
                    .with_thread_names(config.level == LogLevel::Trace),
            )
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    fn open_writer(sink: Sink) -> Result<(NonBlocking, WorkerGuard), InitError> {
        Ok(match sink {
            Sink::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|source| InitError::Io { path, source })?;
                tracing_appender::non_blocking(file)
            }
            Sink::Stderr => tracing_appender::non_blocking(io::stderr()),
            Sink::Discard => tracing_appender::non_blocking(io::sink()),
        })
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        FILTER_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|directives| !directives.trim().is_empty())
            .map(EnvFilter::new)
            .unwrap_or_else(|| EnvFilter::new(default_filter_for(level)))
    }

    /// Debug and trace apply to tidewatch's own crates; dependencies stay at info.
    pub(crate) fn default_filter_for(level: LevelFilter) -> String {
        let ours = if level == LevelFilter::TRACE {
            "trace"
        } else if level == LevelFilter::DEBUG {
            "debug"
        } else {
            return level.to_string().to_lowercase();
        };

        let mut directives = vec![
            "info".to_owned(),
            format!("tidewatch={ours}"),
            format!("tidewatch_capture={ours}"),
            "tower_http=debug".to_owned(),
        ];
        if level == LevelFilter::TRACE && !super::env_truthy("TIDEWATCH_TRACE_DEPS").unwrap_or(false) {
            directives.extend(NOISY_DEPS.iter().map(|dep| format!("{dep}=info")));
        }
        directives.join(",")
    }

}
