//! Lifecycle of the host runtime child process.

pub mod browser;
mod invocation;
pub mod output;
pub mod readiness;
pub mod signals;
pub mod tui;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tidewatch_capture::LogStore;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReadinessStrategy;

pub use invocation::RuntimeInvocation;

const EVENT_CAPACITY: usize = 1_024;
const TAIL_LINES: usize = 20;
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl SupervisorState {
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Idle, Launching)
                | (Launching, Running)
                | (Launching, Stopping)
                | (Launching, Stopped)
                | (Launching, Crashed)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Crashed)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Crashed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Launching => "launching",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    State(SupervisorState),
    Output(OutputLine),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupt,
    Terminate,
    UserQuit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stopped,
    Crashed { code: i32, tail: Vec<String> },
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Stopped => 0,
            Outcome::Crashed { code, .. } => *code,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed waiting on the runtime process: {0}")]
    Wait(io::Error),
}

impl SupervisorError {
    pub fn hint(&self) -> &'static str {
        match self {
            SupervisorError::Spawn { .. } => {
                "install the runtime (`npm i -D wrangler`) or point --runtime at it"
            }
            SupervisorError::Wait(_) => "re-run with --log-level debug for details",
        }
    }
}

pub struct Supervisor {
    invocation: RuntimeInvocation,
    readiness: ReadinessStrategy,
    runtime_port: u16,
    stop_grace: Duration,
    logs: Arc<LogStore>,
    events: broadcast::Sender<SupervisorEvent>,
    state: SupervisorState,
    tail: VecDeque<String>,
}

impl Supervisor {
    pub fn new(
        invocation: RuntimeInvocation,
        readiness: ReadinessStrategy,
        runtime_port: u16,
        stop_grace: Duration,
        logs: Arc<LogStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            invocation,
            readiness,
            runtime_port,
            stop_grace,
            logs,
            events,
            state: SupervisorState::Idle,
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Spawns the runtime and supervises it until it exits.
    ///
    /// A message on `stop` moves to `Stopping` and sends SIGTERM; a second
    /// message, or the grace period elapsing, kills the child outright.
    pub async fn run(
        mut self,
        mut stop: mpsc::Receiver<StopReason>,
    ) -> Result<Outcome, SupervisorError> {
        self.transition(SupervisorState::Launching);
        info!(command = %self.invocation, "launching runtime");

        let mut child = match self.invocation.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                self.transition(SupervisorState::Crashed);
                return Err(SupervisorError::Spawn {
                    program: self.invocation.program().to_owned(),
                    source,
                });
            }
        };

        let (line_tx, mut lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_child_lines(BufReader::new(stdout), OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_child_lines(BufReader::new(stderr), OutputStream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (probe_tx, mut probe_rx) = mpsc::channel::<()>(1);
        let probe = self.readiness.probes().then(|| {
            let port = self.runtime_port;
            tokio::spawn(async move {
                readiness::wait_for_port(port, PROBE_INTERVAL).await;
                let _ = probe_tx.send(()).await;
            })
        });
        let mut probe_pending = probe.is_some();

        let mut lines_open = true;
        let mut stop_open = true;
        let mut kill_at: Option<Instant> = None;

        let status = loop {
            let deadline = kill_at.unwrap_or_else(|| Instant::now() + self.stop_grace);
            tokio::select! {
                status = child.wait() => break status,
                line = lines.recv(), if lines_open => match line {
                    Some(line) => self.on_line(line),
                    None => lines_open = false,
                },
                Some(()) = probe_rx.recv(), if probe_pending => {
                    probe_pending = false;
                    if self.state == SupervisorState::Launching {
                        debug!(port = self.runtime_port, "runtime port accepted a connection");
                        self.transition(SupervisorState::Running);
                    }
                }
                reason = stop.recv(), if stop_open => match reason {
                    Some(reason) if self.state == SupervisorState::Stopping => {
                        warn!(?reason, "second stop request; killing runtime");
                        force_kill(&mut child);
                        kill_at = None;
                    }
                    Some(reason) => {
                        info!(?reason, "stopping runtime");
                        self.transition(SupervisorState::Stopping);
                        terminate(&mut child);
                        kill_at = Some(Instant::now() + self.stop_grace);
                    }
                    None => stop_open = false,
                },
                _ = tokio::time::sleep_until(deadline), if kill_at.is_some() => {
                    warn!(grace = ?self.stop_grace, "runtime ignored SIGTERM; killing it");
                    force_kill(&mut child);
                    kill_at = None;
                }
            }
        };

        if let Some(probe) = probe {
            probe.abort();
        }
        let status = status.map_err(SupervisorError::Wait)?;

        // Children of the runtime can hold the pipes open, so draining is bounded.
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(line) = lines.recv().await {
                self.on_line(line);
            }
        })
        .await;

        Ok(self.finish(status))
    }

    fn finish(&mut self, status: ExitStatus) -> Outcome {
        let stopping = self.state == SupervisorState::Stopping;
        if stopping || status.success() {
            info!(status = %describe_exit_status(status), "runtime stopped");
            self.transition(SupervisorState::Stopped);
            return Outcome::Stopped;
        }

        let code = exit_code(status);
        let tail: Vec<String> = self.tail.iter().cloned().collect();
        self.logs.error(
            "supervisor",
            format!("runtime exited unexpectedly ({})", describe_exit_status(status)),
            Some(json!({ "code": code, "tail": tail })),
        );
        self.transition(SupervisorState::Crashed);
        Outcome::Crashed { code, tail }
    }

    fn on_line(&mut self, line: OutputLine) {
        if self.state == SupervisorState::Launching
            && line.stream == OutputStream::Stdout
            && self.readiness.watches_output()
            && readiness::is_ready_line(&line.text)
        {
            self.transition(SupervisorState::Running);
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.text.clone());
        let _ = self.events.send(SupervisorEvent::Output(line));
    }

    fn transition(&mut self, next: SupervisorState) {
        if !self.state.can_transition_to(next) {
            debug!(from = %self.state, to = %next, "ignoring invalid supervisor transition");
            return;
        }
        debug!(from = %self.state, to = %next, "supervisor transition");
        self.state = next;
        if matches!(next, SupervisorState::Running | SupervisorState::Stopped) {
            self.logs.info("supervisor", format!("runtime {next}"));
        }
        let _ = self.events.send(SupervisorEvent::State(next));
    }
}

async fn forward_child_lines<R>(
    mut reader: BufReader<R>,
    stream: OutputStream,
    sink: mpsc::UnboundedSender<OutputLine>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let trimmed = text.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                let line = OutputLine {
                    stream,
                    text: trimmed.to_owned(),
                };
                if sink.send(line).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(?stream, error = %err, "failed to read runtime output");
                break;
            }
        }
    }
}

/// Sends SIGTERM to the runtime's process group.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // The child leads its own group, so the negative pid reaches the
            // runtime's workers as well.
            let result = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
            if result == 0 {
                return;
            }
            warn!(pid, error = %io::Error::last_os_error(), "SIGTERM failed; killing runtime");
        }
    }
    force_kill(child);
}

fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
            }
        }
    }
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "runtime already gone");
    }
}

pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

pub fn describe_exit_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }

    "unknown status".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use SupervisorState::*;
        assert!(Idle.can_transition_to(Launching));
        assert!(Launching.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Crashed));
        assert!(Launching.can_transition_to(Crashed));

        assert!(!Idle.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Crashed));
        assert!(!Stopped.can_transition_to(Launching));
        assert!(!Crashed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Launching));
    }

    #[test]
    fn only_stopped_and_crashed_are_terminal() {
        assert!(SupervisorState::Stopped.is_terminal());
        assert!(SupervisorState::Crashed.is_terminal());
        assert!(!SupervisorState::Stopping.is_terminal());
    }

    #[test]
    fn crashed_outcome_mirrors_child_code() {
        let outcome = Outcome::Crashed {
            code: 3,
            tail: vec!["boom".into()],
        };
        assert_eq!(outcome.exit_code(), 3);
        assert_eq!(Outcome::Stopped.exit_code(), 0);
    }
}
