//! Tether CLI - runs one analysis server session and controls it from stdin.
//!
//! ```text
//! main() -> load config -> SessionController -> autostart -> command loop
//!                                                              |
//!                                                              v
//!                                              quit | EOF | Ctrl-C -> shutdown
//! ```

mod console;

use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_config::TetherConfig;
use tether_session::{
    CommandResolver, ProcessChannelFactory, SessionController, SessionError, SessionObserver,
    StatusUpdate,
};

use crate::console::{ConsoleObserver, render_server_error};

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Start, stop and watch an external analysis server")]
struct Args {
    /// Config file to use instead of ~/.tether/config.toml.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Workspace root; overrides `[workspace] root`.
    #[arg(long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Wait for an explicit `start` instead of starting immediately.
    #[arg(long)]
    no_autostart: bool,
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Without a log file, drop logs rather than interleave them with the prompt.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!(
                "Failed to open log file {}: {e}",
                candidate.display()
            )),
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tether/logs/tether.log
    if let Some(config_path) = tether_config::config_path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("tether.log"));
    }

    // Fallback: ./.tether/logs/tether.log
    candidates.push(PathBuf::from(".tether").join("logs").join("tether.log"));

    candidates
}

fn load_config(path: Option<&Path>) -> Result<TetherConfig> {
    let loaded = match path {
        Some(path) => {
            let config = TetherConfig::load_from(path)?;
            if config.is_none() {
                bail!("config file {} not found", path.display());
            }
            config
        }
        None => TetherConfig::load()?,
    };
    Ok(loaded.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Restart,
    Status,
    Reload,
    Help,
    Quit,
}

impl Command {
    /// `None` for blank input, `Err` with the offending word otherwise.
    fn parse(line: &str) -> Option<Result<Self, String>> {
        let word = line.split_whitespace().next()?;
        Some(match word.to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "status" => Ok(Self::Status),
            "reload" => Ok(Self::Reload),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            _ => Err(word.to_string()),
        })
    }
}

const HELP: &str = "commands: start, stop, restart, status, reload, help, quit";

/// Let a queued operation finish in the background; outcomes reach the
/// console through the observer.
fn detach(op: impl Future<Output = Result<(), SessionError>> + Send + 'static) {
    tokio::spawn(async move {
        if let Err(e) = op.await {
            tracing::debug!("Lifecycle operation ended with error: {e}");
        }
    });
}

fn render_status(update: &StatusUpdate, has_session: bool) -> String {
    let mut out = format!("status: {}", update.status_line());
    if !has_session {
        out.push_str(" (no session)");
    }
    out.push('\n');
    if let Some(error) = &update.error {
        out.push_str(&render_server_error(error));
    }
    out
}

fn reload(controller: &SessionController, path: Option<&Path>) {
    match load_config(path) {
        Ok(config) => match config.server_config() {
            Some(server) => {
                controller.update_config(server);
                println!("config reloaded; applies on next start or restart");
            }
            None => println!("config has no [server] section; keeping the current one"),
        },
        Err(e) => println!("error: {e:#}"),
    }
}

async fn run_command_loop(controller: &SessionController, config_path: Option<&Path>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };

        match Command::parse(&line) {
            None => {}
            Some(Err(word)) => println!("unknown command `{word}`; {HELP}"),
            Some(Ok(command)) => match command {
                Command::Start => detach(controller.start()),
                Command::Stop => detach(controller.stop()),
                Command::Restart => detach(controller.restart()),
                Command::Status => print!(
                    "{}",
                    render_status(&controller.status(), controller.has_session())
                ),
                Command::Reload => reload(controller, config_path),
                Command::Help => println!("{HELP}"),
                Command::Quit => return Ok(()),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    let Some(server) = config.server_config() else {
        bail!(
            "no [server] section configured; add one to {}",
            args.config
                .clone()
                .or_else(tether_config::config_path)
                .unwrap_or_default()
                .display()
        );
    };

    let workspace = match args.workspace.clone().or_else(|| config.workspace_root()) {
        Some(dir) => dir,
        None => env::current_dir().context("resolving current directory")?,
    };
    tracing::info!(workspace = %workspace.display(), "Using workspace");

    let console: Arc<dyn SessionObserver> = Arc::new(ConsoleObserver::default());
    let controller = SessionController::new(
        server,
        Arc::new(CommandResolver::new(workspace.clone())),
        Arc::new(ProcessChannelFactory),
        vec![console],
    );

    if !args.no_autostart {
        detach(controller.start());
    }

    let result = run_command_loop(&controller, args.config.as_deref()).await;
    controller.shutdown().await;
    result
}
