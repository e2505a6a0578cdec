use std::io;
use std::process::{Command, Stdio};

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use url::Url;

use super::{SupervisorEvent, SupervisorState};

/// Opens `url` with `$BROWSER`, or the platform's default handler.
pub fn open(url: &Url) -> io::Result<()> {
    let (program, mut args) = launcher();
    args.push(url.to_string());
    debug!(%program, ?args, "opening browser");
    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(())
}

fn launcher() -> (String, Vec<String>) {
    if let Ok(browser) = std::env::var("BROWSER") {
        let mut words = browser.split_whitespace().map(str::to_owned);
        if let Some(program) = words.next() {
            return (program, words.collect());
        }
    }
    if cfg!(target_os = "macos") {
        ("open".into(), Vec::new())
    } else if cfg!(windows) {
        ("cmd".into(), vec!["/C".into(), "start".into(), String::new()])
    } else {
        ("xdg-open".into(), Vec::new())
    }
}

/// Opens the dashboard the first time the runtime reports ready.
pub async fn open_when_ready(mut events: broadcast::Receiver<SupervisorEvent>, url: Url) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::State(SupervisorState::Running)) => {
                info!(%url, "opening dashboard");
                if let Err(err) = open(&url) {
                    warn!(%url, error = %err, "failed to open browser; visit the dashboard manually");
                }
                return;
            }
            Ok(SupervisorEvent::State(state)) if state.is_terminal() => return,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn browser_env_overrides_platform_default() {
        std::env::set_var("BROWSER", "firefox --new-tab");
        let (program, args) = launcher();
        std::env::remove_var("BROWSER");
        assert_eq!(program, "firefox");
        assert_eq!(args, vec!["--new-tab".to_string()]);
    }
}
