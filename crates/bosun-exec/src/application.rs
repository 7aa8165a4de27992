//! The shell-application executor.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::debug;

use bosun_types::AgentError;

use crate::harness::{ShellCommand, run_shell};
use crate::{ExecOutput, Executor, RunOptions};

/// Runs a prepared script file as `./"<name>" <commandline>` from the
/// script's own directory.
#[derive(Debug)]
pub struct ApplicationExecutor {
    name: String,
    path: Option<PathBuf>,
    options: RunOptions,
}

impl ApplicationExecutor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            options: RunOptions::default(),
        }
    }
}

impl Executor for ApplicationExecutor {
    fn load(&mut self, path: &Path, options: &Map<String, Value>) -> Result<()> {
        self.path = Some(path.to_path_buf());
        self.options = RunOptions::from_options(options);
        Ok(())
    }

    fn run(&mut self, _function: Option<&str>, args: &[Value]) -> Result<ExecOutput, AgentError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| AgentError::new(1, format!("script {} was not loaded", self.name)))?;
        let dir = path
            .parent()
            .ok_or_else(|| AgentError::new(1, format!("script path {} has no parent", path.display())))?;
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AgentError::new(1, format!("script path {} has no name", path.display())))?;

        let commandline = args.first().map(argument_text).unwrap_or_default();
        let app = command_line(basename, &commandline);

        make_executable(&path).map_err(|e| AgentError::new(1, format!("{e:#}")))?;

        debug!(script = %self.name, command = %app, "starting script execution");
        let spec = ShellCommand {
            command: &app,
            workdir: dir,
            capture_stdout: self.options.capture_stdout,
            capture_stderr: self.options.capture_stderr,
        };
        let output = run_shell(&spec).map_err(|e| AgentError::new(1, format!("{e:#}")))?;
        debug!(
            script = %self.name,
            exit_code = output.exit_code,
            "script execution finished"
        );

        self.options.verify(&self.name, &output)?;
        Ok(output)
    }
}

fn argument_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(unix)]
fn command_line(basename: &str, commandline: &str) -> String {
    format!("./\"{basename}\" {commandline}")
}

#[cfg(not(unix))]
fn command_line(basename: &str, commandline: &str) -> String {
    format!("\"{basename}\" {commandline}")
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat script {}", path.display()))?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o500);
    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to mark script {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
