use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use claude_squad::app::{self, Controller};
use claude_squad::repo::RepoContext;
use claude_squad::{config, daemon};

#[derive(Parser)]
#[command(name = "cs", about = "Manage multiple AI coding assistants in parallel tmux sessions")]
struct Cli {
    /// Program to run in new instances (overrides the configured default)
    #[arg(short, long)]
    program: Option<String>,

    /// Launch the auto-confirm daemon when the controller exits
    #[arg(short = 'y', long = "autoyes")]
    auto_yes: bool,

    /// Internal: run as the auto-confirm daemon
    #[arg(long, hide = true)]
    daemon: bool,

    /// Internal: repository path for daemon mode
    #[arg(long, hide = true)]
    repo_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete this repo's instances, sessions, worktrees, and daemon state
    Reset,
    /// List claude-squad sessions on this host and kill orphaned ones
    Cleanup {
        /// Kill every listed session without prompting
        #[arg(long)]
        kill_all: bool,
    },
    /// Print the config path and parsed config
    Debug,
    /// Print the version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load()?;

    // Hidden daemon mode: re-exec'd by the controller on exit.
    if cli.daemon {
        let repo_path = cli
            .repo_path
            .context("--daemon requires --repo-path")?;
        let repo = RepoContext::discover(&repo_path)?;
        repo.ensure_state_dir()?;
        init_file_logging(&repo.daemon_log_path())?;
        return daemon::run(&repo_path, &cfg);
    }

    match cli.command {
        Some(Commands::Reset) => {
            init_stderr_logging();
            app::reset(&std::env::current_dir()?)
        }
        Some(Commands::Cleanup { kill_all }) => {
            init_stderr_logging();
            app::cleanup(kill_all)
        }
        Some(Commands::Debug) => {
            println!("config path: {}", config::config_path()?.display());
            println!("{cfg:#?}");
            Ok(())
        }
        Some(Commands::Version) => {
            println!("cs {}", claude_squad::VERSION);
            Ok(())
        }
        None => {
            let cwd = std::env::current_dir()?;
            let repo = RepoContext::discover(&cwd)?;
            repo.ensure_state_dir()?;
            // Log to a file inside the state directory so controller output
            // never corrupts an attached PTY.
            init_file_logging(&repo.log_path())?;

            let launch_daemon = cli.auto_yes || cfg.auto_yes;
            let mut controller = Controller::start(&cwd, cfg, cli.program)?;
            controller.run_headless()?;
            controller.shutdown(launch_daemon)
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn init_file_logging(path: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file at {}", path.display()))?;
    let file = Arc::new(file);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(move || Arc::clone(&file))
        .with_ansi(false)
        .init();
    Ok(())
}
