//! bro: runs commands when files change.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads `bro.toml`, sets up logging and hands over to the watch
//! loop, which restarts the configured commands on every relevant change.

mod command;
mod config;
mod debounce;
mod env;
mod filter;
mod paths;
mod process;
mod runner;
mod scaffold;
mod watch;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{Settings, CONFIG_NAME};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "bro",
    version,
    about = "Runs commands when files change",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the configuration file (default: ./bro.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable debug output.
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start watching and running commands (default).
    Run,
    /// Write a starter bro.toml into the current directory.
    Init {
        /// Overwrite an existing file without asking.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workdir = std::env::current_dir().context("failed to get current directory")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init { force } => {
            init_tracing(cli.debug);
            let stdin = std::io::stdin();
            scaffold::init(&workdir, force, stdin.lock(), std::io::stdout())?;
            Ok(())
        }
        Commands::Run => {
            let path = cli.config.unwrap_or_else(|| workdir.join(CONFIG_NAME));
            let config = config::load_config(&path)?;
            init_tracing(cli.debug || config.debug);
            let settings = Settings::from_config(config, &workdir)?;
            watch::run(settings).await
        }
    }
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise bro logs at `debug` with `--debug`
/// and at `info` by default.
fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if debug { "debug" } else { "info" };
        EnvFilter::new(format!("bro={level},notify=warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
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
}
