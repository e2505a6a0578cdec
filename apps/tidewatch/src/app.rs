//! Wires the parser, synthesizer, sidecar and supervisor into one run.

use std::io::{self, IsTerminal};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crossterm::style::Stylize;
use tidewatch_capture::{LogStore, TrafficStore};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::{LaunchMode, SupervisorConfig};
use crate::error::CliError;
use crate::manifest;
use crate::sidecar::{self, ServiceTarget, SidecarState};
use crate::supervisor::output::{ConsoleRenderer, NoiseFilter, SessionInfo};
use crate::supervisor::{browser, signals, tui, Outcome, RuntimeInvocation, Supervisor};
use crate::synth;
use crate::telemetry;

const SERVER_DRAIN: Duration = Duration::from_secs(2);

enum Renderer {
    Console(JoinHandle<()>),
    Tui(JoinHandle<io::Result<()>>),
}

/// Runs tidewatch to completion and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32, CliError> {
    let mode = if cli.is_attach() {
        LaunchMode::Attach
    } else {
        LaunchMode::Primary
    };
    let args = cli.run_args().clone();
    let interactive = io::stdin().is_terminal() && io::stdout().is_terminal();
    let use_tui = interactive && !args.no_tui;
    telemetry::logging::init(&cli.logging.to_config(args.verbose, !use_tui))?;

    let cwd = std::env::current_dir()?;
    let config = SupervisorConfig::from_args(&args, cli.passthrough.clone(), mode, &cwd, interactive)?;
    info!(manifest = %config.manifest_path.display(), mode = mode.as_str(), "starting tidewatch");

    let manifest = Arc::new(manifest::parse(&config.manifest_path)?);
    let companion = synth::synthesize(&manifest, mode == LaunchMode::Primary);
    let companion_path = synth::write(&companion, &config.work_dir)?;

    let logs = Arc::new(LogStore::default());
    let traffic = Arc::new(TrafficStore::default());
    let target = ServiceTarget::from_companion(&companion, config.runtime_url().clone());
    if target.is_none() {
        warn!("attach mode: requests to the inspector port are not proxied");
        eprintln!(
            "{} attach mode: the Network view stays empty. Start your worker with `wrangler dev --persist-to {}`.",
            "note:".yellow(),
            config.persist_to.display()
        );
    }
    let state = SidecarState::new(manifest.clone(), mode, target, traffic, logs.clone())?;

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port))
        .await
        .map_err(|source| CliError::Bind {
            port: config.port,
            source,
        })?;
    let (server_stop, server_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(sidecar::serve(listener, state, async move {
        let _ = server_stopped.await;
    }));

    let invocation = RuntimeInvocation::build(&config, &companion_path);
    let supervisor = Supervisor::new(
        invocation,
        config.readiness,
        config.runtime_port,
        config.stop_grace,
        logs,
    );
    let (stop_tx, stop_rx) = mpsc::channel(4);

    let info = SessionInfo {
        worker: manifest.name().to_owned(),
        mode,
        port: config.port,
        dashboard: config.dashboard_url().to_string(),
    };
    let filter = NoiseFilter::new(config.verbose);
    let renderer = if config.use_tui {
        let events = supervisor.subscribe();
        let stop = stop_tx.clone();
        Renderer::Tui(tokio::task::spawn_blocking(move || tui::run(info, filter, events, stop)))
    } else {
        Renderer::Console(tokio::spawn(
            ConsoleRenderer::new(info, filter).run(supervisor.subscribe()),
        ))
    };
    if config.open_browser {
        tokio::spawn(browser::open_when_ready(
            supervisor.subscribe(),
            config.dashboard_url().clone(),
        ));
    }
    let signal_task = tokio::spawn(signals::forward_signals(stop_tx));

    let outcome = supervisor.run(stop_rx).await;
    signal_task.abort();
    finish_renderer(renderer).await;

    let _ = server_stop.send(());
    match tokio::time::timeout(SERVER_DRAIN, server).await {
        Ok(Ok(Err(err))) => warn!(error = %err, "sidecar server failed"),
        Ok(Err(err)) => warn!(error = %err, "sidecar server task panicked"),
        Err(_) => warn!("in-flight proxied requests abandoned at shutdown"),
        Ok(Ok(Ok(()))) => {}
    }

    let outcome = outcome?;
    if let Outcome::Crashed { code, tail } = &outcome {
        report_crash(*code, tail);
    }
    Ok(outcome.exit_code())
}

async fn finish_renderer(renderer: Renderer) {
    match renderer {
        Renderer::Console(handle) => {
            let _ = handle.await;
        }
        Renderer::Tui(handle) => match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "terminal ui failed"),
            Err(err) => warn!(error = %err, "terminal ui task panicked"),
        },
    }
}

fn report_crash(code: i32, tail: &[String]) {
    eprintln!();
    for line in tail {
        eprintln!("  {}", line.as_str().dim());
    }
    eprintln!("{} runtime exited with code {code}", "error:".red().bold());
    eprintln!(
        "  {} fix the error above and re-run tidewatch; --verbose shows the runtime's full output",
        "hint:".yellow()
    );
}
