use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use super::{Tool, ToolInvocation, run_command, split_words};
use crate::context::vars;

/// Runs the expanded script with `sh -c` inside the working directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellTool;

impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn run(&self, invocation: &ToolInvocation<'_>) -> Result<()> {
        let script = invocation.context.expand(invocation.script)?;
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&script)
            .current_dir(invocation.working_dir);
        run_command(self.name(), command, invocation.timeout)
    }
}

/// Siril in script mode. Input files are linked into `inputs/` under the
/// working directory, which scripts see as `{input_dir}`.
#[derive(Debug, Clone)]
pub struct SirilTool {
    pub binary: String,
}

impl Default for SirilTool {
    fn default() -> Self {
        Self {
            binary: "siril-cli".to_string(),
        }
    }
}

const SIRIL_SCRIPT: &str = "script.ssf";
const SIRIL_REQUIRES: &str = "requires 1.2.0";

impl Tool for SirilTool {
    fn name(&self) -> &str {
        "siril"
    }

    fn run(&self, invocation: &ToolInvocation<'_>) -> Result<()> {
        let input_dir = invocation.working_dir.join("inputs");
        fs::create_dir_all(&input_dir)
            .with_context(|| format!("Failed to create directory: {}", input_dir.display()))?;
        let linked = link_inputs(&invocation.context.input_files(), &input_dir)?;
        debug!(stage = invocation.stage, files = linked, "Linked siril inputs");

        let mut context = invocation.context.clone();
        context.set(vars::INPUT_DIR, input_dir.display().to_string());
        let script = context.expand(invocation.script)?;
        let script_path = invocation.working_dir.join(SIRIL_SCRIPT);
        let declares_version = script
            .lines()
            .any(|line| line.trim_start().starts_with("requires"));
        let body = if declares_version {
            format!("{script}\n")
        } else {
            format!("{SIRIL_REQUIRES}\n{script}\n")
        };
        fs::write(&script_path, body)
            .with_context(|| format!("Failed to write script: {}", script_path.display()))?;

        let mut command = Command::new(&self.binary);
        command
            .arg("-d")
            .arg(invocation.working_dir)
            .arg("-s")
            .arg(&script_path)
            .current_dir(invocation.working_dir);
        run_command(self.name(), command, invocation.timeout)
    }
}

/// Hard links (or copies, across filesystems) `files` into `dir`, keeping
/// file names unique.
fn link_inputs(files: &[PathBuf], dir: &Path) -> Result<usize> {
    let mut used = HashSet::new();
    for (index, file) in files.iter().enumerate() {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("input_{index}"));
        let name = if used.insert(name.clone()) {
            name
        } else {
            format!("{index:05}_{name}")
        };
        let target = dir.join(&name);
        if target.exists() {
            continue;
        }
        if fs::hard_link(file, &target).is_err() {
            fs::copy(file, &target).with_context(|| {
                format!("Failed to copy {} to {}", file.display(), target.display())
            })?;
        }
    }
    Ok(files.len())
}

/// GraXpert command line. The expanded script is the argument list.
#[derive(Debug, Clone)]
pub struct GraxpertTool {
    pub binary: String,
}

impl Default for GraxpertTool {
    fn default() -> Self {
        Self {
            binary: "graxpert".to_string(),
        }
    }
}

impl Tool for GraxpertTool {
    fn name(&self) -> &str {
        "graxpert"
    }

    fn run(&self, invocation: &ToolInvocation<'_>) -> Result<()> {
        let script = invocation.context.expand(invocation.script)?;
        let mut command = Command::new(&self.binary);
        command.arg("-cli");
        for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
            command.args(split_words(line)?);
        }
        command.current_dir(invocation.working_dir);
        run_command(self.name(), command, invocation.timeout)
    }
}
