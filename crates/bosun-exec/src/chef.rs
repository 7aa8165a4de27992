//! The Chef executor: runs one cookbook recipe through `chef-solo`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::debug;

use bosun_types::AgentError;

use crate::base::{ModuleExecutorState, ModuleRef, recipe_attributes};
use crate::{ExecOutput, Executor, RunOptions};

/// Prepares `solo.rb` and `node.json`, optionally vendors dependencies with
/// Berkshelf, then invokes `chef-solo`.
#[derive(Debug)]
pub struct ChefExecutor {
    state: ModuleExecutorState,
    use_berkshelf: bool,
    berksfile_path: Option<String>,
}

impl ChefExecutor {
    pub fn new(name: &str) -> Self {
        Self {
            state: ModuleExecutorState::new(name),
            use_berkshelf: false,
            berksfile_path: None,
        }
    }

    /// Direct the manifest files and the chef-solo invocation into `dir`
    /// instead of the process working directory.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state.workdir = Some(dir.into());
        self
    }

    /// The directory chef-solo should load cookbooks from: the prepared path
    /// itself, or the Berkshelf vendor directory next to it.
    fn cookbook_path(&mut self, module: &str, workdir: &Path) -> Result<PathBuf, AgentError> {
        let path = self.state.path()?.to_path_buf();
        if !self.use_berkshelf {
            return Ok(path);
        }

        debug!(module, "vendoring cookbooks with Berkshelf");
        let berksfile = match &self.berksfile_path {
            Some(relative) => path.join(relative),
            None => path.join(module).join("Berksfile"),
        };
        if !berksfile.is_file() {
            return Err(AgentError::custom(
                0,
                format!("Berksfile {} not found", berksfile.display()),
                None,
            ));
        }

        let vendor_dir = path.join("berks-cookbooks");
        std::fs::create_dir_all(&vendor_dir)
            .map_err(|e| prepare_error(&self.state.name, &e.to_string()))?;

        let command = format!(
            "berks vendor --berksfile={} {}",
            berksfile.display(),
            vendor_dir.display()
        );
        let output = self.state.run_module_command(&command, workdir)?;
        if output.exit_code != 0 {
            return Err(AgentError::custom(
                0,
                "Berks returned error code".to_string(),
                Some(output.to_value()),
            ));
        }

        Ok(vendor_dir)
    }

    /// Write `solo.rb` into the prepared path unless one already exists.
    fn configure(&self, cookbook_path: &Path) -> Result<PathBuf> {
        let path = self
            .state
            .path
            .as_deref()
            .context("executor was not loaded")?;
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create cookbook directory {}", path.display()))?;

        let solo_file = path.join("solo.rb");
        if !solo_file.exists() {
            let contents = format!("cookbook_path \"{}\"", cookbook_path.display());
            std::fs::write(&solo_file, contents)
                .with_context(|| format!("failed to write {}", solo_file.display()))?;
        }
        Ok(solo_file)
    }
}

/// The `node.json` document chef-solo is pointed at.
pub fn render_node_manifest(
    module: &str,
    recipe: &str,
    attributes: Option<&Map<String, Value>>,
) -> Value {
    let mut node = Map::new();
    node.insert(
        "run_list".to_string(),
        json!([format!("recipe[{module}::{recipe}]")]),
    );
    if let Some(attributes) = attributes {
        node.insert(module.to_string(), Value::Object(attributes.clone()));
    }
    Value::Object(node)
}

fn prepare_error(name: &str, detail: &str) -> AgentError {
    AgentError::custom(
        0,
        format!("Cookbook {name} returned error code: {detail}"),
        Some(json!({"exitCode": 2, "stdout": null, "stderr": detail})),
    )
}

impl Executor for ChefExecutor {
    fn load(&mut self, path: &Path, options: &Map<String, Value>) -> Result<()> {
        self.state.path = Some(path.to_path_buf());
        self.state.options = RunOptions::from_options(options);
        self.use_berkshelf = options
            .get("useBerkshelf")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.berksfile_path = options
            .get("berksfilePath")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(())
    }

    fn run(&mut self, _function: Option<&str>, args: &[Value]) -> Result<ExecOutput, AgentError> {
        let mref = ModuleRef::parse(&self.state.name)?;
        let workdir = self.state.workdir()?;
        let cookbook_path = self.cookbook_path(&mref.module, &workdir)?;

        let solo_file = self
            .configure(&cookbook_path)
            .map_err(|e| prepare_error(&self.state.name, &format!("{e:#}")))?;

        let node = render_node_manifest(&mref.module, &mref.recipe, recipe_attributes(args));
        std::fs::write(workdir.join("node.json"), node.to_string())
            .map_err(|e| prepare_error(&self.state.name, &e.to_string()))?;

        let command = format!("chef-solo -j node.json -c {}", solo_file.display());
        let output = self.state.run_module_command(&command, &workdir)?;
        self.state.options.verify(&self.state.name, &output)?;
        Ok(output)
    }
}
