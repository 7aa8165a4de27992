//! Executors for the bosun agent.
//!
//! An executor is a named strategy for running one script of an execution
//! plan: a plain shell application, a Chef cookbook recipe, or a Puppet
//! module class. All three share the subprocess harness in [`harness`] and
//! the exit-code policy: with `verifyExitcode` enabled (the default), a
//! non-zero exit becomes an [`AgentError`] whose additional data carries the
//! captured `{exitCode, stdout, stderr}`.
//!
//! The [`ExecutorRegistry`] maps a script `Type` tag to a factory. The three
//! builtin tags are registered by [`ExecutorRegistry::builtin`]; this is the
//! agent's only extensibility hook.

mod application;
mod base;
mod chef;
mod harness;
mod puppet;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use bosun_types::{AgentError, TYPE_APPLICATION, TYPE_CHEF, TYPE_PUPPET};

pub use application::ApplicationExecutor;
pub use base::ModuleRef;
pub use chef::ChefExecutor;
pub use harness::{ShellCommand, run_shell};
pub use puppet::PuppetExecutor;

/// Captured outcome of one executor invocation.
///
/// Serializes with the wire field names used inside result envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    #[serde(rename = "exitCode")]
    pub exit_code: i64,
    /// Captured stdout, `None` when capture was disabled.
    pub stdout: Option<String>,
    /// Captured stderr, `None` when capture was disabled.
    pub stderr: Option<String>,
}

impl ExecOutput {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("output is always serializable")
    }
}

/// Stream-capture and exit-code options common to every executor.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    pub verify_exitcode: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            capture_stdout: true,
            capture_stderr: true,
            verify_exitcode: true,
        }
    }
}

impl RunOptions {
    /// Read the common flags out of a script's `Options` mapping.
    pub fn from_options(options: &Map<String, Value>) -> Self {
        let flag = |key: &str, default: bool| {
            options.get(key).and_then(Value::as_bool).unwrap_or(default)
        };
        Self {
            capture_stdout: flag("captureStdout", true),
            capture_stderr: flag("captureStderr", true),
            verify_exitcode: flag("verifyExitcode", true),
        }
    }

    /// Apply the exit-code policy to a finished command.
    pub fn verify(&self, name: &str, output: &ExecOutput) -> Result<(), AgentError> {
        if self.verify_exitcode && output.exit_code != 0 {
            return Err(AgentError::custom(
                0,
                format!("Script {name} returned error code"),
                Some(output.to_value()),
            ));
        }
        Ok(())
    }
}

/// One interchangeable execution strategy.
pub trait Executor: Send {
    /// Bind the executor to a prepared file or directory and its options.
    fn load(&mut self, path: &Path, options: &Map<String, Value>) -> Result<()>;

    /// Run the payload, optionally invoking a named function with arguments.
    fn run(&mut self, function: Option<&str>, args: &[Value]) -> Result<ExecOutput, AgentError>;
}

/// Factory for one executor tag. `name` is the script name for applications
/// and the `module::recipe` reference for Chef/Puppet.
pub type ExecutorFactory = fn(name: &str) -> Box<dyn Executor>;

/// Maps script `Type` tags to executor factories.
#[derive(Clone)]
pub struct ExecutorRegistry {
    factories: BTreeMap<String, ExecutorFactory>,
}

impl ExecutorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the three builtin tags.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(TYPE_APPLICATION, |name| {
            Box::new(ApplicationExecutor::new(name))
        });
        registry.register(TYPE_CHEF, |name| Box::new(ChefExecutor::new(name)));
        registry.register(TYPE_PUPPET, |name| Box::new(PuppetExecutor::new(name)));
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, factory: ExecutorFactory) {
        self.factories.insert(tag.into(), factory);
    }

    /// Instantiate an executor for `tag`, or `None` for an unknown tag.
    pub fn create(&self, tag: &str, name: &str) -> Option<Box<dyn Executor>> {
        self.factories.get(tag).map(|factory| factory(name))
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_registry_knows_all_tags() {
        let registry = ExecutorRegistry::builtin();
        assert_eq!(registry.tags(), vec!["Application", "Chef", "Puppet"]);
        assert!(registry.create("Application", "deploy").is_some());
        assert!(registry.create("Chef", "cookbook::recipe").is_some());
        assert!(registry.create("Ansible", "x").is_none());
    }

    #[test]
    fn run_options_defaults() {
        let options = RunOptions::from_options(&Map::new());
        assert!(options.capture_stdout);
        assert!(options.capture_stderr);
        assert!(options.verify_exitcode);
    }

    #[test]
    fn run_options_overrides() {
        let mut map = Map::new();
        map.insert("captureStdout".into(), json!(false));
        map.insert("verifyExitcode".into(), json!(false));
        let options = RunOptions::from_options(&map);
        assert!(!options.capture_stdout);
        assert!(options.capture_stderr);
        assert!(!options.verify_exitcode);
    }

    #[test]
    fn verify_raises_offset_code() {
        let options = RunOptions::default();
        let output = ExecOutput {
            exit_code: 3,
            stdout: Some(String::new()),
            stderr: Some("boom".into()),
        };
        let err = options.verify("deploy", &output).expect_err("non-zero exit");
        assert_eq!(err.code, 100);
        assert_eq!(err.additional_data.as_ref().unwrap()["exitCode"], 3);
    }

    #[test]
    fn verify_can_be_disabled() {
        let options = RunOptions {
            verify_exitcode: false,
            ..Default::default()
        };
        let output = ExecOutput {
            exit_code: 3,
            stdout: None,
            stderr: None,
        };
        options.verify("deploy", &output).expect("policy disabled");
    }

    #[test]
    fn exec_output_wire_names() {
        let output = ExecOutput {
            exit_code: 0,
            stdout: Some("hi".into()),
            stderr: None,
        };
        let json = serde_json::to_string(&output).expect("serialize");
        assert_eq!(json, r#"{"exitCode":0,"stdout":"hi","stderr":null}"#);
    }
}
