//! Parsing of configured command lines.
//!
//! A command line such as `GOOS=linux go build -o app` is split with shell
//! word rules into leading environment assignments, the executable and its
//! arguments. Chains of parsed commands run one after another.

use std::fmt;

use anyhow::{anyhow, bail, Context, Result};

/// A single parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Inline `KEY=VALUE` assignments that precede the executable.
    pub env_assignments: Vec<String>,
    /// Program to execute.
    pub executable: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Whether the process environment of `bro` itself is passed on.
    pub inherit_env: bool,
}

/// Commands run in order, aborting on the first failure.
pub type CommandChain = Vec<CommandSpec>;

impl CommandSpec {
    /// Returns a copy that does not inherit the parent environment.
    pub fn without_inherited_env(mut self) -> Self {
        self.inherit_env = false;
        self
    }

    /// Splits the inline assignments into key/value pairs.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env_assignments
            .iter()
            .filter_map(|assignment| assignment.split_once('='))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the value is quoted, so assignments still read as assignments.
        for (key, value) in self.env_pairs() {
            write!(f, "{}={} ", key, shell_words::quote(value))?;
        }
        let words = std::iter::once(&self.executable).chain(self.args.iter());
        write!(f, "{}", shell_words::join(words))
    }
}

fn is_assignment(token: &str) -> bool {
    token.contains('=') && !token.starts_with('=')
}

/// Parses one command line.
pub fn parse(line: &str) -> Result<CommandSpec> {
    let words =
        shell_words::split(line).with_context(|| format!("failed to parse command {:?}", line))?;
    if words.is_empty() {
        bail!("empty command");
    }

    let split = words
        .iter()
        .position(|word| !is_assignment(word))
        .ok_or_else(|| anyhow!("command {:?} has no executable", line))?;
    let mut rest = words[split..].iter().cloned();
    let executable = rest
        .next()
        .ok_or_else(|| anyhow!("command {:?} has no executable", line))?;

    Ok(CommandSpec {
        env_assignments: words[..split].to_vec(),
        executable,
        args: rest.collect(),
        inherit_env: true,
    })
}

/// Parses a list of command lines, preserving their order.
pub fn parse_all<S: AsRef<str>>(lines: &[S]) -> Result<CommandChain> {
    lines.iter().map(|line| parse(line.as_ref())).collect()
}
