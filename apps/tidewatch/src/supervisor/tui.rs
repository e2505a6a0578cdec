use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Terminal;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use super::output::{strip_ansi, NoiseFilter, SessionInfo};
use super::{browser, OutputStream, StopReason, SupervisorEvent, SupervisorState};

const SCROLLBACK: usize = 2_000;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct View {
    info: SessionInfo,
    state: SupervisorState,
    lines: VecDeque<(OutputStream, String)>,
    stop_requested: bool,
}

impl View {
    fn apply(&mut self, event: SupervisorEvent, filter: NoiseFilter) {
        match event {
            SupervisorEvent::State(state) => self.state = state,
            SupervisorEvent::Output(line) => {
                if !filter.keep(&line.text) {
                    return;
                }
                if self.lines.len() == SCROLLBACK {
                    self.lines.pop_front();
                }
                self.lines.push_back((line.stream, strip_ansi(&line.text)));
            }
        }
    }

    fn status_style(&self) -> Style {
        let color = match self.state {
            SupervisorState::Running => Color::Green,
            SupervisorState::Crashed => Color::Red,
            SupervisorState::Stopping | SupervisorState::Stopped => Color::Yellow,
            SupervisorState::Idle | SupervisorState::Launching => Color::Cyan,
        };
        Style::default().fg(color).add_modifier(Modifier::BOLD)
    }
}

/// Full-screen renderer. Blocks until the supervisor reaches a terminal
/// state or its event stream closes; run it on a blocking thread.
pub fn run(
    info: SessionInfo,
    filter: NoiseFilter,
    mut events: broadcast::Receiver<SupervisorEvent>,
    stop: mpsc::Sender<StopReason>,
) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    crossterm::execute!(&mut stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut view = View {
        info,
        state: SupervisorState::Idle,
        lines: VecDeque::new(),
        stop_requested: false,
    };

    let result = event_loop(&mut terminal, &mut view, filter, &mut events, &stop);

    disable_raw_mode()?;
    drop(terminal);
    let mut out = io::stdout();
    crossterm::execute!(&mut out, LeaveAlternateScreen)?;
    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    view: &mut View,
    filter: NoiseFilter,
    events: &mut broadcast::Receiver<SupervisorEvent>,
    stop: &mpsc::Sender<StopReason>,
) -> io::Result<()> {
    loop {
        loop {
            match events.try_recv() {
                Ok(event) => view.apply(event, filter),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "terminal ui fell behind"),
                Err(TryRecvError::Closed) => return Ok(()),
            }
        }
        if view.state.is_terminal() {
            return Ok(());
        }

        terminal.draw(|frame| draw(frame, view))?;

        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => request_stop(view, stop),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                request_stop(view, stop)
            }
            KeyCode::Char('o') => {
                if let Ok(url) = Url::parse(&view.info.dashboard) {
                    if let Err(err) = browser::open(&url) {
                        warn!(error = %err, "failed to open browser");
                    }
                }
            }
            KeyCode::Char('c') => view.lines.clear(),
            _ => {}
        }
    }
}

fn request_stop(view: &mut View, stop: &mpsc::Sender<StopReason>) {
    // A second request escalates to a kill inside the supervisor.
    if let Err(err) = stop.try_send(StopReason::UserQuit) {
        warn!(error = %err, "stop request not delivered");
    }
    view.stop_requested = true;
}

fn draw(frame: &mut ratatui::Frame<'_>, view: &View) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4), Constraint::Min(1), Constraint::Length(1)])
        .split(frame.area());

    let header = Paragraph::new(vec![
        Line::from(vec![
            Span::styled(format!(" {} ", view.state), view.status_style()),
            Span::raw(format!(" {} ({})", view.info.worker, view.info.mode.as_str())),
        ]),
        Line::from(format!(" dashboard  {}", view.info.dashboard)),
    ])
    .block(Block::default().title(" 🌊 tidewatch ").borders(Borders::ALL));
    frame.render_widget(header, chunks[0]);

    let height = chunks[1].height.saturating_sub(2) as usize;
    let skip = view.lines.len().saturating_sub(height);
    let body: Vec<Line<'_>> = view
        .lines
        .iter()
        .skip(skip)
        .map(|(stream, text)| match stream {
            OutputStream::Stdout => Line::from(text.as_str()),
            OutputStream::Stderr => Line::styled(text.as_str(), Style::default().fg(Color::Red)),
        })
        .collect();
    let output = Paragraph::new(body).block(Block::default().title(" runtime ").borders(Borders::ALL));
    frame.render_widget(output, chunks[1]);

    let footer = if view.stop_requested {
        " stopping… press q again to force"
    } else {
        " q quit · o open dashboard · c clear"
    };
    frame.render_widget(
        Paragraph::new(footer).style(Style::default().add_modifier(Modifier::DIM)),
        chunks[2],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchMode;
    use crate::supervisor::OutputLine;

    fn view() -> View {
        View {
            info: SessionInfo {
                worker: "app".into(),
                mode: LaunchMode::Primary,
                port: 8787,
                dashboard: "http://localhost:8787/__tidewatch/".into(),
            },
            state: SupervisorState::Idle,
            lines: VecDeque::new(),
            stop_requested: false,
        }
    }

    #[test]
    fn view_tracks_state_and_filtered_output() {
        let mut view = view();
        let filter = NoiseFilter::new(false);
        view.apply(SupervisorEvent::State(SupervisorState::Running), filter);
        view.apply(
            SupervisorEvent::Output(OutputLine {
                stream: OutputStream::Stdout,
                text: "GET /__tidewatch/health 200".into(),
            }),
            filter,
        );
        view.apply(
            SupervisorEvent::Output(OutputLine {
                stream: OutputStream::Stderr,
                text: "\u{1b}[31mboom\u{1b}[0m".into(),
            }),
            filter,
        );
        assert_eq!(view.state, SupervisorState::Running);
        assert_eq!(view.lines.len(), 1);
        assert_eq!(view.lines[0], (OutputStream::Stderr, "boom".to_string()));
    }

    #[test]
    fn quit_sends_a_stop_request() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut view = view();
        request_stop(&mut view, &tx);
        assert_eq!(rx.try_recv().unwrap(), StopReason::UserQuit);
        assert!(view.stop_requested);
    }
}
