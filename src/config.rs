//! Configuration management for bro.
//!
//! This module defines the structure of the `bro.toml` configuration file,
//! loads it, and normalizes it into the `Settings` used at runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::command::{self, CommandChain};
use crate::filter::WatchFilter;
use crate::runner::ShutdownConfig;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_NAME: &str = "bro.toml";

/// Directory that is never worth watching.
const ALWAYS_IGNORED_DIR: &str = ".git";

/// Placeholder expanded to the working directory in watched paths.
const WORKDIR_VAR: &str = "$WORKDIR";

/// Top-level configuration structure corresponding to `bro.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enables debug logging.
    pub debug: bool,
    pub run: RunConfig,
}

/// The `[run]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Commands run once at startup, before `commands`.
    pub init: Vec<String>,
    /// Commands run at startup and after every accepted change.
    pub commands: Vec<String>,
    pub watch: WatchConfig,
    pub ignore: IgnoreConfig,
    pub environment: EnvironmentConfig,
    /// Minimum spacing between two restarts, in milliseconds.
    pub delay: u64,
    /// Seconds to wait for a graceful exit before killing (0 means 1).
    pub timeout: u64,
    /// Whether to interrupt before killing.
    pub graceful: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            init: Vec::new(),
            commands: Vec::new(),
            watch: WatchConfig::default(),
            ignore: IgnoreConfig::default(),
            environment: EnvironmentConfig::default(),
            delay: 0,
            timeout: 1,
            graceful: true,
        }
    }
}

/// The `[run.watch]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directories watched in addition to the working directory.
    pub directories: Vec<String>,
    /// Whether to also watch every subdirectory of `directories`.
    pub sub_directories: bool,
    /// Whether subdirectory discovery follows symlinks.
    pub symlinks: bool,
    /// File suffixes that trigger a run.
    pub extensions: Vec<String>,
}

/// The `[run.ignore]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Substrings marking ignored directories.
    pub directories: Vec<String>,
    /// Regular expressions matched against file paths.
    pub files: Vec<String>,
}

/// The `[run.environment]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Files with `KEY=VALUE` lines.
    pub files: Vec<String>,
    /// Static `KEY=VALUE` variables.
    pub variables: Vec<String>,
    /// Whether commands inherit the environment of bro itself.
    pub inherit: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            variables: Vec::new(),
            inherit: true,
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Runtime settings derived from the configuration file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub workdir: PathBuf,
    pub debug: bool,
    pub init: CommandChain,
    pub commands: CommandChain,
    /// Configured directories, already expanded.
    pub watch_dirs: Vec<PathBuf>,
    pub sub_directories: bool,
    pub symlinks: bool,
    pub filter: WatchFilter,
    pub env_files: Vec<PathBuf>,
    pub env_variables: Vec<String>,
    pub delay: Duration,
    pub shutdown: ShutdownConfig,
}

impl Settings {
    /// Validates `config` and resolves paths against `workdir`.
    pub fn from_config(config: Config, workdir: &Path) -> Result<Self> {
        let run = config.run;
        if run.commands.is_empty() {
            bail!("no commands configured in [run]");
        }
        if run.watch.extensions.is_empty() {
            warn!("no watched extensions configured, changes will never trigger a run");
        }

        let inherit = run.environment.inherit;
        let parse_chain = |lines: &[String], table: &str| -> Result<CommandChain> {
            let chain = command::parse_all(lines)
                .with_context(|| format!("invalid command in run.{}", table))?;
            Ok(chain
                .into_iter()
                .map(|spec| if inherit { spec } else { spec.without_inherited_env() })
                .collect())
        };
        let init = parse_chain(&run.init, "init")?;
        let commands = parse_chain(&run.commands, "commands")?;

        let mut ignore_dirs = run.ignore.directories;
        if !ignore_dirs.iter().any(|dir| dir == ALWAYS_IGNORED_DIR) {
            ignore_dirs.push(ALWAYS_IGNORED_DIR.to_string());
        }
        let ignore_files = run
            .ignore
            .files
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("invalid regexp {:?}", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        let watch_dirs: Vec<PathBuf> = run
            .watch
            .directories
            .iter()
            .map(|dir| expand_path(workdir, dir))
            .collect();
        let mut roots = vec![workdir.to_path_buf()];
        roots.extend(watch_dirs.iter().cloned());

        Ok(Self {
            workdir: workdir.to_path_buf(),
            debug: config.debug,
            init,
            commands,
            watch_dirs,
            sub_directories: run.watch.sub_directories,
            symlinks: run.watch.symlinks,
            filter: WatchFilter {
                extensions: run.watch.extensions,
                ignore_dirs,
                ignore_files,
                roots,
            },
            env_files: run
                .environment
                .files
                .iter()
                .map(|file| expand_path(workdir, file))
                .collect(),
            env_variables: run.environment.variables,
            delay: Duration::from_millis(run.delay),
            shutdown: ShutdownConfig::new(run.graceful, run.timeout),
        })
    }

    /// The init chain followed by the run chain, used once at startup.
    pub fn startup_chain(&self) -> CommandChain {
        self.init.iter().chain(&self.commands).cloned().collect()
    }
}

/// Expands `$WORKDIR` and anchors relative paths at `workdir`.
pub fn expand_path(workdir: &Path, path: &str) -> PathBuf {
    let expanded = PathBuf::from(path.replacen(WORKDIR_VAR, &workdir.to_string_lossy(), 1));
    if expanded.is_absolute() {
        expanded
    } else {
        workdir.join(expanded)
    }
}
