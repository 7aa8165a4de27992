//! The plan runner.
//!
//! A [`PlanRunner`] owns everything one plan needs to execute: the plan's
//! artifact cache, one [`ScriptRunner`] per declared script, and the parsed
//! plan body. Running the plan evaluates the body against the script table
//! and yields either a result value or an [`AgentError`] — both of which the
//! agent folds into a result envelope. Disposal clears the artifact cache on
//! every path.

mod body;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use bosun_exec::{ExecOutput, Executor, ExecutorRegistry};
use bosun_files::FilesManager;
use bosun_types::{AgentError, ExecutionPlan, FileRef, Script, TYPE_APPLICATION};

pub use body::{Argument, BodyExpr, parse_body};

/// Lazily-loaded executor for one script of the plan.
pub struct ScriptRunner {
    name: String,
    script: Script,
    executor: Box<dyn Executor>,
    loaded: bool,
}

impl ScriptRunner {
    /// Bind a script to its executor. `Application` executors are named
    /// after the script; Chef/Puppet executors after the module reference.
    pub fn new(name: &str, script: Script, registry: &ExecutorRegistry) -> Result<Self, AgentError> {
        let executor_name = if script.kind == TYPE_APPLICATION {
            name
        } else {
            script.entry_point.as_str()
        };
        let executor = registry.create(&script.kind, executor_name).ok_or_else(|| {
            AgentError::new(
                1,
                format!("the application type in {name} is not a valid executor {}", script.kind),
            )
        })?;
        Ok(Self {
            name: name.to_string(),
            script,
            executor,
            loaded: false,
        })
    }

    /// Run the script, loading it (files materialised, executor bound) on
    /// first use.
    pub fn execute(
        &mut self,
        function: Option<&str>,
        args: &[Value],
        files: &mut FilesManager,
    ) -> Result<ExecOutput, AgentError> {
        if !self.loaded {
            let path = self.prepare_files(files).map_err(into_agent_error)?;
            self.executor
                .load(&path, &self.script.options)
                .map_err(into_agent_error)?;
            self.loaded = true;
        }
        self.executor.run(function, args)
    }

    /// Materialise the script's file tree; returns the path handed to the
    /// executor (entry-point file for applications, the script directory for
    /// module executors).
    fn prepare_files(&self, files: &mut FilesManager) -> Result<std::path::PathBuf> {
        for file_ref in &self.script.files {
            files.put_file(file_ref, &self.name)?;
        }

        if self.script.kind == TYPE_APPLICATION {
            files.put_file(&FileRef::Id(self.script.entry_point.clone()), &self.name)
        } else {
            Ok(files.script_dir(&self.name))
        }
    }
}

/// Errors crossing from the anyhow plumbing into envelope territory keep
/// their agent code when they have one and default to the generic code 1.
pub fn into_agent_error(error: anyhow::Error) -> AgentError {
    match error.downcast::<AgentError>() {
        Ok(agent_error) => agent_error,
        Err(other) => AgentError::new(1, format!("{other:#}")),
    }
}

/// Prepares and executes one plan.
pub struct PlanRunner {
    plan: ExecutionPlan,
    files: FilesManager,
    scripts: BTreeMap<String, ScriptRunner>,
}

impl PlanRunner {
    /// Build the runner: artifact cache plus one executor per script.
    pub fn new(plan: ExecutionPlan, storage: &Path, registry: &ExecutorRegistry) -> Result<Self> {
        let files = FilesManager::new(storage, &plan)
            .context("failed to prepare the plan's artifact cache")?;

        let mut scripts = BTreeMap::new();
        for (name, script) in &plan.scripts {
            let runner =
                ScriptRunner::new(name, script.clone(), registry).map_err(anyhow::Error::new)?;
            scripts.insert(name.clone(), runner);
        }

        Ok(Self {
            plan,
            files,
            scripts,
        })
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Evaluate the plan body and return its value.
    pub fn execute(&mut self) -> Result<Value, AgentError> {
        let body = self.plan.body.clone().unwrap_or_default();
        let Some(expr) = parse_body(&body)? else {
            return Ok(Value::Null);
        };
        debug!(script = expr.script, "evaluating plan body");

        let args = resolve_arguments(&expr.args, &self.plan.parameters)?;
        let script = self.scripts.get_mut(&expr.script).ok_or_else(|| {
            AgentError::new(1, format!("plan body references unknown script {}", expr.script))
        })?;

        let output = script.execute(expr.method.as_deref(), &args, &mut self.files)?;

        let mut value = output.to_value();
        for attribute in &expr.projections {
            value = value
                .get(attribute)
                .cloned()
                .ok_or_else(|| {
                    AgentError::new(1, format!("result has no attribute {attribute}"))
                })?;
        }
        Ok(value)
    }

    /// Clear the plan's artifact cache. Called on every exit path.
    pub fn dispose(&self) {
        self.files.clear();
    }
}

fn resolve_arguments(
    args: &[Argument],
    parameters: &serde_json::Map<String, Value>,
) -> Result<Vec<Value>, AgentError> {
    args.iter()
        .map(|arg| match arg {
            Argument::Literal(value) => Ok(value.clone()),
            Argument::Parameter(name) => parameters.get(name).cloned().ok_or_else(|| {
                AgentError::new(1, format!("plan body references unknown parameter {name}"))
            }),
        })
        .collect()
}
