//! Environment composition for spawned commands.
//!
//! Sources are layered from lowest to highest precedence: the inherited
//! process environment, environment files, static variables from the
//! configuration and finally the inline assignments of the command itself.
//! Layers are merged into a single map (last write wins) and the child is
//! spawned with a cleared environment, so duplicate keys never reach the OS.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::command::CommandSpec;

/// Resolved environment of one command.
pub type Environment = BTreeMap<String, String>;

/// Builds the environment for each command step.
#[derive(Debug, Clone, Default)]
pub struct EnvComposer {
    inherited: Vec<(String, String)>,
    files: Vec<PathBuf>,
    variables: Vec<String>,
}

impl EnvComposer {
    /// Creates a composer that inherits the current process environment.
    pub fn new(files: Vec<PathBuf>, variables: Vec<String>) -> Self {
        let inherited = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        Self::with_inherited(inherited, files, variables)
    }

    /// Creates a composer with an explicit base environment.
    pub fn with_inherited(
        inherited: Vec<(String, String)>,
        files: Vec<PathBuf>,
        variables: Vec<String>,
    ) -> Self {
        Self {
            inherited,
            files,
            variables,
        }
    }

    /// Resolves the full environment for `spec`.
    ///
    /// Environment files are re-read on every call so edits made between
    /// runs are picked up.
    pub fn compose(&self, spec: &CommandSpec) -> Environment {
        let mut env = Environment::new();
        if spec.inherit_env {
            env.extend(self.inherited.iter().cloned());
        }
        for file in &self.files {
            env.extend(read_env_file(file));
        }
        env.extend(
            self.variables
                .iter()
                .filter_map(|variable| split_assignment(variable, "variable")),
        );
        env.extend(
            spec.env_pairs()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );
        env
    }
}

fn split_assignment(entry: &str, source: &str) -> Option<(String, String)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Some((key.to_string(), value.to_string())),
        _ => {
            warn!("ignoring {} {:?}, expected KEY=VALUE", source, entry);
            None
        }
    }
}

/// Reads `KEY=VALUE` lines from an environment file.
///
/// Values are taken literally: no quote removal and no `$VAR` expansion.
/// An optional `export ` prefix is stripped. An unreadable file or a
/// malformed line is reported and skipped.
pub fn read_env_file(path: &Path) -> Vec<(String, String)> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!("failed to read environment file {}: {}", path.display(), err);
            return Vec::new();
        }
    };
    let mut vars = Vec::new();
    for line in raw.lines() {
        // One reader per line, so a stray quote cannot swallow the next lines.
        for item in dotenvy::from_read_iter(literal_line(line).as_bytes()) {
            match item {
                Ok(pair) => vars.push(pair),
                Err(err) => warn!("skipping entry in {}: {}", path.display(), err),
            }
        }
    }
    vars
}

// Rewrites the value as a double-quoted string with `\`, `"` and `$`
// escaped, which dotenvy reads back verbatim.
fn literal_line(line: &str) -> String {
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = match line.split_once('=') {
        Some((key, value)) if !key.trim_start().starts_with('#') => (key, value),
        _ => return line.to_string(),
    };
    let mut out = String::with_capacity(line.len() + 2);
    out.push_str(key);
    out.push_str("=\"");
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
