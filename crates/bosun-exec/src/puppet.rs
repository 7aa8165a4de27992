//! The Puppet executor: applies one module class through `puppet apply`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};

use bosun_types::AgentError;

use crate::base::{ModuleExecutorState, ModuleRef, recipe_attributes};
use crate::{ExecOutput, Executor, RunOptions};

/// Generates `manifest.pp`, a default `hiera.yaml`, and the hiera data file,
/// then invokes `puppet apply` against the prepared module path.
#[derive(Debug)]
pub struct PuppetExecutor {
    state: ModuleExecutorState,
}

impl PuppetExecutor {
    pub fn new(name: &str) -> Self {
        Self {
            state: ModuleExecutorState::new(name),
        }
    }

    /// Direct generated files and the puppet invocation into `dir` instead
    /// of the process working directory.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state.workdir = Some(dir.into());
        self
    }

    /// Write a stock `hiera.yaml` unless the working directory has one.
    fn configure(&self, workdir: &Path) -> Result<()> {
        let hiera_file = workdir.join("hiera.yaml");
        if hiera_file.exists() {
            return Ok(());
        }

        let config: BTreeMap<&str, Value> = BTreeMap::from([
            ("backends", json!("yaml")),
            ("logger", json!("console")),
            ("hierarchy", json!("%{env}")),
            ("yaml", json!({"datadir": "/etc/puppet/hieradata"})),
        ]);
        let rendered = serde_yaml::to_string(&config).context("failed to render hiera.yaml")?;
        std::fs::write(&hiera_file, rendered)
            .with_context(|| format!("failed to write {}", hiera_file.display()))
    }

    fn generate_files(
        &self,
        mref: &ModuleRef,
        attributes: Option<&Map<String, Value>>,
        workdir: &Path,
    ) -> Result<()> {
        let manifest = render_manifest(&mref.module, &mref.recipe);
        std::fs::write(workdir.join("manifest.pp"), manifest)
            .context("failed to write manifest.pp")?;

        let Some(attributes) = attributes else {
            return Ok(());
        };
        let hiera_data = render_hiera_data(&mref.module, attributes);
        let rendered = serde_yaml::to_string(&hiera_data).context("failed to render hiera data")?;
        std::fs::write(workdir.join("default.yaml"), rendered)
            .context("failed to write default.yaml")
    }
}

/// The single-node site manifest applying the module class.
pub fn render_manifest(module: &str, recipe: &str) -> String {
    if recipe.is_empty() {
        format!("node 'default' {{ class {{ {module}:}}}}")
    } else {
        format!("node 'default' {{ class {{ {module}::{recipe}:}}}}")
    }
}

/// Recipe attributes flattened to fully-qualified hiera keys.
pub fn render_hiera_data(module: &str, attributes: &Map<String, Value>) -> BTreeMap<String, Value> {
    attributes
        .iter()
        .map(|(key, value)| (format!("{module}::{key}"), value.clone()))
        .collect()
}

impl Executor for PuppetExecutor {
    fn load(&mut self, path: &Path, options: &Map<String, Value>) -> Result<()> {
        self.state.path = Some(path.to_path_buf());
        self.state.options = RunOptions::from_options(options);
        Ok(())
    }

    fn run(&mut self, _function: Option<&str>, args: &[Value]) -> Result<ExecOutput, AgentError> {
        let mref = ModuleRef::parse(&self.state.name)?;
        let workdir = self.state.workdir()?;
        let module_path = self.state.path()?.to_path_buf();

        self.configure(&workdir).map_err(|e| {
            AgentError::custom(
                0,
                format!("Module {} returned error code: {e:#}", self.state.name),
                Some(json!({"exitCode": 2, "stdout": null, "stderr": e.to_string()})),
            )
        })?;
        self.generate_files(&mref, recipe_attributes(args), &workdir)
            .map_err(|e| {
                AgentError::custom(
                    0,
                    format!("Module {} returned error code: {e:#}", self.state.name),
                    Some(json!({"exitCode": 2, "stdout": null, "stderr": e.to_string()})),
                )
            })?;

        let command = format!(
            "puppet apply --hiera_config=hiera.yaml --modulepath {} manifest.pp",
            module_path.display()
        );
        let output = self.state.run_module_command(&command, &workdir)?;
        self.state.options.verify(&self.state.name, &output)?;
        Ok(output)
    }
}
