//! airack: supervisor for a local AI stack.
//!
//! Starts, stops and watches an image-generation server, a web chat front end
//! and a model-inference daemon, either from an interactive terminal UI or
//! from one-shot headless commands.

mod app;
mod cache;
mod config;
mod controller;
mod daemon;
mod error;
mod events;
mod handle;
mod logs;
mod output;
mod probe;
mod proctable;
mod service;
mod supervisor;
mod tui;

#[cfg(test)]
mod testing;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::{App, AppAction};
use crate::config::Settings;
use crate::controller::StartOutcome;
use crate::events::{Event, ShutdownSignal};
use crate::logs::{LogKind, LogSink, LogStream};
use crate::probe::LivenessProbe;
use crate::proctable::{ProcessTable, SystemProcessTable};
use crate::service::{ServiceKind, ServiceState};
use crate::supervisor::{StatusSnapshot, Supervisor};

const LOG_ENV: &str = "AIRACK_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "airack",
    version,
    about = "Supervisor for a local image-gen / chat UI / inference stack",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to airack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Interactive terminal UI (default).
    Ui,
    /// Probe every service once and print the result.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Start services and stream their logs until Ctrl-C.
    Run {
        /// Services to run (default: all).
        #[arg(value_enum)]
        services: Vec<ServiceKind>,
    },
    /// Stop one service, or all of them.
    Stop {
        #[arg(value_enum, default_value = "all")]
        target: StopTarget,
    },
    /// Clear the safelisted cache directories.
    CleanCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum StopTarget {
    ImageGen,
    ChatUi,
    Inference,
    All,
}

impl StopTarget {
    fn kind(self) -> Option<ServiceKind> {
        match self {
            StopTarget::ImageGen => Some(ServiceKind::ImageGen),
            StopTarget::ChatUi => Some(ServiceKind::ChatUi),
            StopTarget::Inference => Some(ServiceKind::InferenceDaemon),
            StopTarget::All => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = config::home_dir();
    let settings = config::load(cli.config.as_deref())?.resolve(home.as_deref())?;
    let command = cli.command.unwrap_or(Commands::Ui);
    init_tracing(matches!(command, Commands::Ui), settings.log_file.as_deref())?;

    match command {
        Commands::Ui => run_ui(settings).await,
        Commands::Status { json } => print_status(settings, json).await,
        Commands::Run { services } => run_headless(settings, services).await,
        Commands::Stop { target } => stop_headless(settings, target).await,
        Commands::CleanCache => clean_cache_headless(settings).await,
    }
}

/// Headless modes log to stderr. The UI owns the terminal, so tracing goes to
/// the configured log file or nowhere.
fn init_tracing(ui: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    if !ui {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
        return Ok(());
    }
    let Some(path) = log_file else {
        return Ok(());
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn build_supervisor(settings: &Settings, sink: LogSink) -> Supervisor {
    let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
    let probe = Arc::new(LivenessProbe::new(table, settings.probe_timeout));
    let targets = cache::safelisted_targets(
        settings.image_cache_root.as_deref(),
        settings.chat_data_dir.as_deref(),
    );
    Supervisor::new(
        settings.services.clone(),
        probe,
        sink,
        settings.grace_period,
        targets,
    )
}

/// Clears the image-gen cache root once, when configured to.
fn clean_on_start(settings: &Settings, sink: &LogSink) {
    if !settings.clean_cache_on_start {
        return;
    }
    let targets = cache::safelisted_targets(settings.image_cache_root.as_deref(), None);
    cache::clean(&targets, sink);
}

async fn run_ui(settings: Settings) -> Result<()> {
    let (sink, stream) = logs::channel();
    let mut supervisor = build_supervisor(&settings, sink.clone());
    let mut app = App::new(&settings.services, settings.max_lines);
    clean_on_start(&settings, &sink);

    let (event_tx, mut event_rx) = mpsc::channel(256);
    spawn_log_forwarder(stream, event_tx.clone());
    spawn_input_listener(event_tx.clone());
    spawn_signal_listener(event_tx);

    let mut terminal = tui::init_terminal().context("failed to initialize terminal")?;
    let mut draw_ticker = tokio::time::interval(Duration::from_millis(150));
    let mut refresh = tokio::time::interval(settings.refresh_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut result = Ok(());

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                Event::Key(key) => {
                    let action = app.handle_key(key);
                    if let Err(err) =
                        handle_app_action(action, &mut app, &mut supervisor, &mut terminal).await
                    {
                        result = Err(err);
                        break;
                    }
                }
                Event::Resize => {
                    let _ = terminal.autoresize();
                }
                Event::Log(entry) => app.on_log(entry),
                Event::Shutdown(signal) => {
                    app.set_status_warning_persistent(format!(
                        "received {}, shutting down",
                        signal.label()
                    ));
                    app.should_quit = true;
                }
            },
            _ = refresh.tick() => {
                supervisor.reap_exited();
                let status = supervisor.refresh_status().await;
                app.apply_status(&status);
            }
            _ = draw_ticker.tick() => {}
        }

        app.sync_controllers(&supervisor);
        if let Err(err) = tui::draw(&mut app, &mut terminal) {
            result = Err(err.into());
            break;
        }
        if app.should_quit {
            break;
        }
    }

    if settings.stop_on_exit {
        app.mark_pending(AppAction::StopAll);
        app.set_status_warning_persistent("stopping all services before exit");
        let _ = tui::draw(&mut app, &mut terminal);
        supervisor.stop_all().await;
    }
    tui::restore_terminal(terminal).context("failed to restore terminal")?;
    result
}

async fn handle_app_action(
    action: AppAction,
    app: &mut App,
    supervisor: &mut Supervisor,
    terminal: &mut tui::TuiTerminal,
) -> Result<()> {
    let Some(busy) = action.describe() else {
        return Ok(());
    };
    app.mark_pending(action);
    app.set_status_warning_persistent(format!("{}...", busy));
    tui::draw(app, terminal)?;

    match action {
        AppAction::Start(kind) => match supervisor.start_service(kind).await {
            Ok(StartOutcome::Launched { .. }) => app.set_status_message(format!("{} started", kind)),
            Ok(StartOutcome::AlreadyRunning) | Ok(StartOutcome::RunningExternally) => {
                app.set_status_message(format!("{} is already running", kind))
            }
            Err(err) => app.set_status_warning(err.to_string()),
        },
        AppAction::Stop(kind) => {
            supervisor.stop_service(kind).await;
            app.set_status_message(format!("{} stopped", kind));
        }
        AppAction::StartAll => {
            let failed = supervisor
                .start_all()
                .await
                .into_iter()
                .filter(|(_, result)| result.is_err())
                .count();
            if failed == 0 {
                app.set_status_message("all services started");
            } else {
                app.set_status_warning(format!("{} service(s) failed to start", failed));
            }
        }
        AppAction::StopAll => {
            supervisor.stop_all().await;
            app.set_status_message("all services stopped");
        }
        AppAction::CleanCache => {
            let failed = supervisor
                .clean_cache()
                .into_iter()
                .filter(|result| result.is_err())
                .count();
            if failed == 0 {
                app.set_status_message("caches cleared");
            } else {
                app.set_status_warning(format!("{} cache directory(ies) could not be cleared", failed));
            }
        }
        AppAction::None | AppAction::Quit => {}
    }

    app.sync_controllers(supervisor);
    let status = supervisor.refresh_status().await;
    app.apply_status(&status);
    Ok(())
}

/// One row of `airack status --json`.
#[derive(Debug, Serialize)]
struct StatusReport {
    service: ServiceKind,
    name: String,
    state: ServiceState,
}

fn status_reports(settings: &Settings, status: &StatusSnapshot) -> Vec<StatusReport> {
    settings
        .services
        .iter()
        .map(|spec| StatusReport {
            service: spec.kind,
            name: spec.name.clone(),
            state: status.get(&spec.kind).copied().unwrap_or(ServiceState::Unknown),
        })
        .collect()
}

async fn print_status(settings: Settings, json: bool) -> Result<()> {
    let (sink, _stream) = logs::channel();
    let supervisor = build_supervisor(&settings, sink);
    let status = supervisor.refresh_status().await;
    let reports = status_reports(&settings, &status);
    if json {
        let rendered =
            serde_json::to_string_pretty(&reports).context("failed to serialize status")?;
        println!("{}", rendered);
    } else {
        for report in reports {
            println!(
                "{:<10} {:<12} {}",
                report.service,
                report.name,
                report.state.label()
            );
        }
    }
    Ok(())
}

/// Prints child output to stdout. Supervisor notices reach the operator
/// through tracing on stderr instead.
fn print_entry(entry: &logs::LogEntry) {
    if entry.kind == LogKind::Output {
        println!("{}", output::format_plain(entry));
    }
}

/// Prints whatever is still queued, waiting briefly for drain tasks to finish.
async fn flush_stream(mut stream: LogStream) {
    let drained = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(entry) = stream.recv().await {
            print_entry(&entry);
        }
    })
    .await;
    if drained.is_err() {
        for entry in stream.drain() {
            print_entry(&entry);
        }
    }
}

async fn run_headless(settings: Settings, services: Vec<ServiceKind>) -> Result<()> {
    let (sink, mut stream) = logs::channel();
    let mut supervisor = build_supervisor(&settings, sink.clone());
    clean_on_start(&settings, &sink);
    drop(sink);

    let mut kinds: Vec<ServiceKind> = if services.is_empty() {
        ServiceKind::ALL.to_vec()
    } else {
        services
    };
    kinds.sort();
    kinds.dedup();
    let everything = kinds.len() == ServiceKind::ALL.len();

    if everything {
        supervisor.start_all().await;
    } else {
        for kind in &kinds {
            // Failures are already reported through the log sink.
            let _ = supervisor.start_service(*kind).await;
        }
    }

    let (event_tx, mut event_rx) = mpsc::channel(4);
    spawn_signal_listener(event_tx);
    let mut refresh = tokio::time::interval(settings.refresh_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<StatusSnapshot> = None;

    loop {
        tokio::select! {
            Some(entry) = stream.recv() => print_entry(&entry),
            Some(event) = event_rx.recv() => {
                if let Event::Shutdown(signal) = event {
                    info!("received {}, stopping services", signal.label());
                    break;
                }
            }
            _ = refresh.tick() => {
                for (kind, status) in supervisor.reap_exited() {
                    warn!(service = %kind, %status, "service exited");
                }
                let status = supervisor.refresh_status().await;
                log_status_changes(last.as_ref(), &status);
                last = Some(status);
            }
        }
    }

    if everything {
        supervisor.stop_all().await;
    } else {
        for kind in &kinds {
            supervisor.stop_service(*kind).await;
        }
    }
    drop(supervisor);
    flush_stream(stream).await;
    Ok(())
}

fn log_status_changes(previous: Option<&StatusSnapshot>, current: &StatusSnapshot) {
    for (kind, state) in current {
        if previous.and_then(|prev| prev.get(kind)) != Some(state) {
            info!(service = %kind, state = state.label(), "status");
        }
    }
}

async fn stop_headless(settings: Settings, target: StopTarget) -> Result<()> {
    let (sink, stream) = logs::channel();
    let mut supervisor = build_supervisor(&settings, sink);
    match target.kind() {
        Some(kind) => supervisor.stop_service(kind).await,
        None => supervisor.stop_all().await,
    }
    drop(supervisor);
    flush_stream(stream).await;
    Ok(())
}

async fn clean_cache_headless(settings: Settings) -> Result<()> {
    let (sink, _stream) = logs::channel();
    let supervisor = build_supervisor(&settings, sink);
    let failed = supervisor
        .clean_cache()
        .into_iter()
        .filter(|result| result.is_err())
        .count();
    if failed > 0 {
        anyhow::bail!("{} cache directory(ies) could not be cleared", failed);
    }
    Ok(())
}

fn spawn_log_forwarder(mut stream: LogStream, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        while let Some(entry) = stream.recv().await {
            if tx.send(Event::Log(entry)).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key))
                    if key.kind == crossterm::event::KeyEventKind::Press =>
                {
                    Event::Key(key)
                }
                Ok(crossterm::event::Event::Resize(..)) => Event::Resize,
                _ => continue,
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Event::Shutdown(ShutdownSignal::Interrupt)).await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Event::Shutdown(ShutdownSignal::Terminate)).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Event::Shutdown(ShutdownSignal::Interrupt)).await;
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
