//! `bro init`: writes a starter configuration file.

use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::CONFIG_NAME;

const TEMPLATE: &str = include_str!("../templates/bro.toml");

/// Renders the template for a project named after `workdir`.
pub fn render_template(workdir: &Path) -> String {
    let mut project = workdir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app".to_string());
    if cfg!(windows) {
        project.push_str(".exe");
    }
    TEMPLATE.replace("$PROJECT", &project)
}

/// Writes `bro.toml` into `workdir`.
///
/// An existing file is only replaced with `force` or after the user answers
/// `y` on `input`. Returns whether the file was written.
pub fn init<R: BufRead, W: Write>(
    workdir: &Path,
    force: bool,
    mut input: R,
    mut output: W,
) -> Result<bool> {
    let path = workdir.join(CONFIG_NAME);
    if path.exists() && !force {
        write!(
            output,
            "There is {} in current directory, would you like to overwrite? (y/n): ",
            CONFIG_NAME
        )?;
        output.flush()?;
        let mut answer = String::new();
        input.read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            writeln!(output, "Not overwriting...")?;
            return Ok(false);
        }
    }

    std::fs::write(&path, render_template(workdir))
        .with_context(|| format!("failed to generate default {}", path.display()))?;
    info!("wrote {}", path.display());
    Ok(true)
}
