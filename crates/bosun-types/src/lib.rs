//! Core wire types for the bosun deployment agent.
//!
//! This crate defines the execution-plan document as it arrives over the
//! message bus, the execution-result envelope the agent publishes back, and
//! the [`AgentError`] type that carries an error code into that envelope.
//!
//! # Example
//!
//! ```
//! use bosun_types::ExecutionPlan;
//!
//! let plan: ExecutionPlan = serde_json::from_str(
//!     r#"{"Scripts": {}, "Files": {}}"#,
//! ).expect("parse");
//! assert_eq!(plan.format_version, "1.0.0");
//! ```

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Format version assumed when a plan omits `FormatVersion`.
pub const DEFAULT_FORMAT_VERSION: &str = "1.0.0";

/// Format version stamped onto every published result envelope.
pub const RESULT_FORMAT_VERSION: &str = "2.0.0";

/// Action tag on every published result envelope.
pub const RESULT_ACTION: &str = "Execution:Result";

/// Script type tag for the shell-application executor.
pub const TYPE_APPLICATION: &str = "Application";
/// Script type tag for the Chef executor.
pub const TYPE_CHEF: &str = "Chef";
/// Script type tag for the Puppet executor.
pub const TYPE_PUPPET: &str = "Puppet";

/// File type tag marking an externally fetched artifact.
pub const TYPE_DOWNLOADABLE: &str = "Downloadable";

fn default_format_version() -> String {
    DEFAULT_FORMAT_VERSION.to_string()
}

/// A deployment plan as delivered by the orchestrator.
///
/// The document uses PascalCase keys on the wire (`FormatVersion`, `Scripts`,
/// ...). Structural validation lives in `bosun-validate` and runs on the raw
/// JSON document *before* this type is constructed, so deserialization here
/// can assume a well-formed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// SemVer format version; the validator enforces the supported range.
    #[serde(rename = "FormatVersion", default = "default_format_version")]
    pub format_version: String,
    /// Opaque plan identifier; filled from message metadata when absent.
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Routing key for a dynamic reply queue.
    #[serde(rename = "ReplyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Monotonic stamp for replay suppression.
    #[serde(rename = "Stamp", default, skip_serializing_if = "Option::is_none")]
    pub stamp: Option<i64>,
    /// Orchestration snippet evaluated to produce the result value.
    #[serde(rename = "Body", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "Scripts", default)]
    pub scripts: BTreeMap<String, Script>,
    #[serde(rename = "Files", default)]
    pub files: BTreeMap<String, FileSpec>,
    #[serde(rename = "Options", default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    /// Free-form parameters, addressable from the plan body as `args.<key>`.
    #[serde(rename = "Parameters", default)]
    pub parameters: Map<String, Value>,
}

impl ExecutionPlan {
    /// Parse a plan out of raw document bytes.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// One named script inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    /// Executor tag: `Application`, `Chef`, or `Puppet`.
    #[serde(rename = "Type")]
    pub kind: String,
    /// File id for `Application`; `module::recipe` reference otherwise.
    #[serde(rename = "EntryPoint")]
    pub entry_point: String,
    /// Additional files to materialise before the script runs.
    #[serde(rename = "Files", default)]
    pub files: Vec<FileRef>,
    /// Executor-specific options (`captureStdout`, `useBerkshelf`, ...).
    #[serde(rename = "Options", default)]
    pub options: Map<String, Value>,
}

/// A reference from a script to a declared file.
///
/// Either a bare file id, or a single-entry mapping from a per-script
/// logical name to a file id (used to alias downloadables).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileRef {
    Id(String),
    Alias(BTreeMap<String, String>),
}

impl FileRef {
    /// The referenced file id, for either shape.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            FileRef::Id(id) => Some(id),
            FileRef::Alias(map) => map.values().next().map(String::as_str),
        }
    }

    /// The `(logical_name, file_id)` pair of an aliased reference.
    pub fn alias(&self) -> Option<(&str, &str)> {
        match self {
            FileRef::Id(_) => None,
            FileRef::Alias(map) => map
                .iter()
                .next()
                .map(|(name, id)| (name.as_str(), id.as_str())),
        }
    }
}

/// A file declared by a plan, in either of its two shapes.
///
/// Inline files carry `Body`/`BodyType`/`Name`; downloadables carry
/// `Type: Downloadable`, `URL`, `Name`. The validator enforces which keys
/// must be present for which shape and format version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "URL", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "Body", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "BodyType", default, skip_serializing_if = "Option::is_none")]
    pub body_type: Option<String>,
}

impl FileSpec {
    pub fn is_downloadable(&self) -> bool {
        self.kind.as_deref() == Some(TYPE_DOWNLOADABLE)
    }
}

/// An agent-level failure that can be encoded into a result envelope.
///
/// `code` lands in the envelope's `ErrorCode`; `additional_data` (typically
/// the `{exitCode, stdout, stderr}` of a failed subprocess) lands under
/// `Body.AdditionalInfo`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AgentError {
    pub code: i64,
    pub message: String,
    pub additional_data: Option<Value>,
}

impl AgentError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            additional_data: None,
        }
    }

    /// A plan-format violation (validator codes 2 and 9).
    pub fn format(code: i64, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    /// An executor-originated failure. The stored code is offset by 100 to
    /// keep executor failures distinguishable from agent-level codes.
    pub fn custom(code: i64, message: impl Into<String>, additional_data: Option<Value>) -> Self {
        Self {
            code: code + 100,
            message: message.into(),
            additional_data,
        }
    }
}

/// Raised when a result envelope is requested for a plan with no `ID`.
#[derive(Debug, thiserror::Error)]
#[error("ID attribute is missing from the execution plan")]
pub struct MissingPlanId;

/// The envelope published back to the orchestrator after a plan has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(rename = "FormatVersion")]
    pub format_version: String,
    /// Fresh undashed UUID identifying this envelope.
    #[serde(rename = "ID")]
    pub id: String,
    /// The `ID` of the plan this result answers.
    #[serde(rename = "SourceID")]
    pub source_id: String,
    #[serde(rename = "Action")]
    pub action: String,
    /// Zero on success; otherwise the failing [`AgentError`] code.
    #[serde(rename = "ErrorCode")]
    pub error_code: i64,
    #[serde(rename = "Body")]
    pub body: Value,
    #[serde(rename = "Time")]
    pub time: String,
    /// Copied from the plan so the pump can honour dynamic reply routing.
    #[serde(rename = "ReplyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

fn new_envelope_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl ExecutionResult {
    /// Build a success envelope around the value the plan body produced.
    pub fn from_result(result: Value, plan_id: Option<&str>) -> Result<Self, MissingPlanId> {
        let source_id = plan_id.ok_or(MissingPlanId)?;
        Ok(Self {
            format_version: RESULT_FORMAT_VERSION.to_string(),
            id: new_envelope_id(),
            source_id: source_id.to_string(),
            action: RESULT_ACTION.to_string(),
            error_code: 0,
            body: result,
            time: now_timestamp(),
            reply_to: None,
        })
    }

    /// Build a failure envelope out of an [`AgentError`].
    pub fn from_error(error: &AgentError, plan_id: Option<&str>) -> Result<Self, MissingPlanId> {
        let source_id = plan_id.ok_or(MissingPlanId)?;
        let body = serde_json::json!({
            "Message": error.message,
            "AdditionalInfo": error.additional_data,
        });
        Ok(Self {
            format_version: RESULT_FORMAT_VERSION.to_string(),
            id: new_envelope_id(),
            source_id: source_id.to_string(),
            action: RESULT_ACTION.to_string(),
            error_code: error.code,
            body,
            time: now_timestamp(),
            reply_to: None,
        })
    }

    /// Serialize the envelope to the wire representation.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("envelope is always serializable")
    }
}
