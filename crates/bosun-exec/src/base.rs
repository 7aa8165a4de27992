//! State and helpers shared by the Chef and Puppet executors.

use std::env;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use bosun_types::AgentError;

use crate::harness::{ShellCommand, run_shell};
use crate::{ExecOutput, RunOptions};

/// A `module::recipe` entry-point reference, split on the last `::`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub module: String,
    pub recipe: String,
}

impl ModuleRef {
    /// Split an entry point; references without `::` are invalid.
    pub fn parse(name: &str) -> Result<Self, AgentError> {
        let Some(split_at) = name.rfind("::") else {
            return Err(AgentError::custom(
                0,
                format!("Module recipe name format {name} is not valid"),
                None,
            ));
        };
        Ok(Self {
            module: name[..split_at].to_string(),
            recipe: name[split_at + 2..].to_string(),
        })
    }
}

/// Load-time state common to the Chef and Puppet executors.
#[derive(Debug, Default)]
pub(crate) struct ModuleExecutorState {
    pub name: String,
    pub path: Option<PathBuf>,
    pub options: RunOptions,
    pub workdir: Option<PathBuf>,
}

impl ModuleExecutorState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn path(&self) -> Result<&Path, AgentError> {
        self.path
            .as_deref()
            .ok_or_else(|| AgentError::new(1, format!("executor {} was not loaded", self.name)))
    }

    /// The directory manifests are written into and commands run from.
    /// Defaults to the process working directory.
    pub fn workdir(&self) -> Result<PathBuf, AgentError> {
        match &self.workdir {
            Some(dir) => Ok(dir.clone()),
            None => env::current_dir()
                .map_err(|e| AgentError::new(1, format!("cannot resolve working directory: {e}"))),
        }
    }

    /// Run a command through the harness, folding stdout lines that contain
    /// `ERROR` into stderr: chef-solo and puppet report many failures on
    /// stdout with a zero-context stderr.
    pub fn run_module_command(
        &self,
        command: &str,
        workdir: &Path,
    ) -> Result<ExecOutput, AgentError> {
        let spec = ShellCommand {
            command,
            workdir,
            capture_stdout: self.options.capture_stdout,
            capture_stderr: self.options.capture_stderr,
        };
        let mut output =
            run_shell(&spec).map_err(|e| AgentError::new(1, format!("{e:#}")))?;

        if let (Some(stdout), Some(stderr)) = (&output.stdout, &mut output.stderr) {
            for line in stdout.lines().filter(|line| line.contains("ERROR")) {
                stderr.push_str(line);
                stderr.push('\n');
            }
            *stderr = stderr.trim_end().to_string();
        }

        debug!(
            name = %self.name,
            exit_code = output.exit_code,
            "module command finished"
        );
        Ok(output)
    }
}

/// The first call argument interpreted as recipe attributes, when present.
pub(crate) fn recipe_attributes(args: &[Value]) -> Option<&serde_json::Map<String, Value>> {
    args.first().and_then(Value::as_object)
}
