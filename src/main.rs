//! shepherd - a process orchestrator for development environments
//!
//! Keeps watch over long-running developer processes (SSH tunnels, port
//! forwards, local daemons): starts them in dependency order, captures their
//! output, restarts them with exponential backoff, and cascades stops and
//! failures through the dependency graph. A terminal UI shows it all.

// Core modules (config, terminal events, logging)
mod core;
// Process orchestration
mod process;
// Main application logic
mod app;
// Terminal UI rendering
mod ui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::prelude::*;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::{App, Notice};
use crate::core::{Config, Event, EventHandler};
use crate::process::Manager;

/// A process orchestrator for development environments
#[derive(Parser, Debug)]
#[command(name = "shepherd")]
#[command(version)]
#[command(about = "Keep watch over your development processes")]
#[command(long_about = "Shepherd keeps watch over your processes, herding them together,\n\
ensuring none stray, and bringing back any that wander off.\n\n\
Run without arguments to open the TUI. Optionally pass a stack,\n\
group, or process name to auto-start it on launch.")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Stack, group, or process to auto-start on launch
    name: Option<String>,

    /// Path to config file (default: ~/.config/shepherd/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging to file
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the config file in your editor
    Edit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(crate::core::default_config_path);

    if let Some(Command::Edit) = cli.command {
        return edit_config(&config_path);
    }

    // First run: write a commented example config and bail out so the user
    // can fill it in.
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("creating config directory")?;
        }
        std::fs::write(&config_path, crate::core::example_config())
            .context("writing example config")?;
        println!(
            "Created example config at {}\nEdit it and run shepherd again.",
            config_path.display()
        );
        return Ok(());
    }

    let config = Config::load(&config_path)?;
    config.validate()?;

    if cli.verbose {
        init_file_logging()?;
    }

    let manager = Manager::new(config)?;

    // Terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(Arc::clone(&manager), cli.name.clone());
    spawn_signal_handlers(&app, config_path);

    let event_handler = EventHandler::new(Duration::from_millis(250));
    let result = run_app(&mut terminal, &mut app, event_handler).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        return Err(e);
    }

    Ok(())
}

async fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    mut event_handler: EventHandler,
) -> Result<()> {
    loop {
        terminal.draw(|frame| ui::draw(frame, app))?;

        match event_handler.next().await? {
            Event::Tick => app.on_tick(),
            Event::Key(key) => app.on_key(key),
            Event::Resize(_, _) => {}
        }

        if app.should_quit {
            // Stop all children before the terminal is restored.
            app.cleanup().await;
            break;
        }
    }

    Ok(())
}

/// SIGTERM/SIGINT request shutdown; SIGHUP reloads and revalidates the
/// catalog. The running manager keeps its original catalog (the graph is
/// immutable), so a valid reload just tells the user to restart.
fn spawn_signal_handlers(app: &App, config_path: PathBuf) {
    let notices = app.notice_sender();

    {
        let notices = notices.clone();
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            let mut int = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            let _ = notices.send(Notice::Terminate);
        });
    }

    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(_) => return,
        };
        while hup.recv().await.is_some() {
            let notice = match Config::load(&config_path).and_then(|cfg| {
                cfg.validate()?;
                Ok(())
            }) {
                Ok(()) => Notice::Info(
                    "Config reloaded and valid. Restart shepherd to apply changes.".to_string(),
                ),
                Err(e) => Notice::Error(format!("Config reload failed: {e:#}")),
            };
            if notices.send(notice).is_err() {
                break;
            }
        }
    });
}

fn init_file_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shepherd")
        .join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("shepherd.log"))?;
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(tracing_subscriber::EnvFilter::new("shepherd=debug"))
        .init();

    Ok(())
}

fn edit_config(config_path: &std::path::Path) -> Result<()> {
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "nano".to_string());

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("opening editor")?;

    if !status.success() {
        anyhow::bail!("editor exited with {}", status);
    }
    Ok(())
}
