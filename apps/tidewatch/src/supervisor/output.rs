use crossterm::style::Stylize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::{OutputStream, SupervisorEvent, SupervisorState};
use crate::config::LaunchMode;

/// Runtime output that only matters when debugging tidewatch itself.
const NOISE_PATTERNS: &[&str] = &[
    "/__tidewatch",
    "TIDEWATCH_TARGET",
    "tidewatch.companion",
    "has access to the following bindings",
    "Reloading local server",
    "Local server updated and ready",
    "⎔ Reloading",
    "⎔ Starting local server",
    "[wrangler:info] Detected changes",
];

#[derive(Debug, Clone, Copy)]
pub struct NoiseFilter {
    verbose: bool,
}

impl NoiseFilter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn keep(&self, line: &str) -> bool {
        if self.verbose {
            return true;
        }
        let plain = strip_ansi(line);
        !NOISE_PATTERNS.iter().any(|pattern| plain.contains(pattern))
    }
}

/// Removes ANSI CSI escape sequences (`ESC [ ... final`).
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if ('@'..='~').contains(&next) {
                    break;
                }
            }
            continue;
        }
        out.push(ch);
    }
    out
}

/// What the renderers show about the current run.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub worker: String,
    pub mode: LaunchMode,
    pub port: u16,
    pub dashboard: String,
}

impl SessionInfo {
    pub fn proxy_line(&self) -> String {
        match self.mode {
            LaunchMode::Primary => format!("http://localhost:{}", self.port),
            LaunchMode::Attach => "not proxied in attach mode".to_string(),
        }
    }
}

/// Plain console output for non-interactive sessions.
pub struct ConsoleRenderer {
    info: SessionInfo,
    filter: NoiseFilter,
}

impl ConsoleRenderer {
    pub fn new(info: SessionInfo, filter: NoiseFilter) -> Self {
        Self { info, filter }
    }

    pub async fn run(self, mut events: broadcast::Receiver<SupervisorEvent>) {
        loop {
            match events.recv().await {
                Ok(SupervisorEvent::Output(line)) => {
                    if !self.filter.keep(&line.text) {
                        continue;
                    }
                    match line.stream {
                        OutputStream::Stdout => println!("{}", line.text),
                        OutputStream::Stderr => eprintln!("{}", line.text),
                    }
                }
                Ok(SupervisorEvent::State(state)) => {
                    self.on_state(state);
                    if state.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "console fell behind runtime output");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn on_state(&self, state: SupervisorState) {
        match state {
            SupervisorState::Launching => {
                println!("{} starting runtime for {}", "🌊".cyan(), self.info.worker.as_str().bold());
            }
            SupervisorState::Running => {
                println!();
                println!("🌊 tidewatch is watching {}", self.info.worker.as_str().bold());
                println!("   dashboard  {}", self.info.dashboard.as_str().cyan());
                println!("   worker     {}", self.info.proxy_line());
                println!();
            }
            SupervisorState::Stopping => println!("{}", "stopping runtime…".dim()),
            SupervisorState::Stopped => println!("{}", "runtime stopped".dim()),
            SupervisorState::Crashed | SupervisorState::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_ansi("\u{1b}[1;32mready\u{1b}[0m now"), "ready now");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn hides_internal_chatter_unless_verbose() {
        let quiet = NoiseFilter::new(false);
        assert!(!quiet.keep("[wrangler:inf] GET /__tidewatch/requests 200 OK (3ms)"));
        assert!(!quiet.keep("Your Worker has access to the following bindings:"));
        assert!(!quiet.keep("- TIDEWATCH_TARGET: orders-api"));
        assert!(!quiet.keep("⎔ Reloading local server..."));
        assert!(quiet.keep("[wrangler:inf] GET /orders 200 OK (12ms)"));
        assert!(quiet.keep("Error: D1_ERROR: no such table: orders"));

        let verbose = NoiseFilter::new(true);
        assert!(verbose.keep("⎔ Reloading local server..."));
    }

    #[test]
    fn attach_mode_has_no_proxy_url() {
        let info = SessionInfo {
            worker: "app".into(),
            mode: LaunchMode::Attach,
            port: 8787,
            dashboard: "http://localhost:8787/__tidewatch/".into(),
        };
        assert!(info.proxy_line().contains("attach"));
    }
}
