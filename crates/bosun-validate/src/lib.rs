//! Validation of execution plan documents.
//!
//! [`validate`] runs over the raw JSON document, before any typed
//! deserialization, so that a malformed plan produces a code-2/code-9
//! [`AgentError`] for the failure envelope instead of a serde error. Rules
//! are evaluated in a fixed order and the first violation aborts.
//!
//! Which rules apply depends on the plan's `FormatVersion`:
//!
//! * below `2.1.0` only `Application` scripts and inline files exist;
//! * `2.1.0` adds `Chef`/`Puppet` scripts and `Downloadable` files;
//! * `2.2.0` adds the Berkshelf options for Chef scripts.

use semver::Version;
use serde_json::Value;

use bosun_types::{AgentError, TYPE_APPLICATION, TYPE_CHEF, TYPE_PUPPET};

/// Highest plan format version this agent understands.
pub const MAX_FORMAT_VERSION: &str = "2.2.0";

const BERKSHELF_OPTIONS: [&str; 2] = ["useBerkshelf", "berksfilePath"];

fn supported_range_ceiling() -> Version {
    Version::new(2, 2, 0)
}

/// Check a plan document against the rules for its declared format version.
pub fn validate(plan: &Value) -> Result<(), AgentError> {
    let doc = plan
        .as_object()
        .ok_or_else(|| AgentError::format(2, "execution plan is not a document"))?;

    let raw_version = match doc.get("FormatVersion") {
        Some(Value::String(s)) => s.as_str(),
        None => bosun_types::DEFAULT_FORMAT_VERSION,
        Some(_) => {
            return Err(AgentError::format(9, "FormatVersion is not a string"));
        }
    };
    let version = Version::parse(raw_version).map_err(|_| {
        AgentError::format(
            9,
            format!(
                "Unsupported format version {raw_version} (I support versions <={MAX_FORMAT_VERSION})"
            ),
        )
    })?;
    if version > supported_range_ceiling() {
        return Err(AgentError::format(
            9,
            format!(
                "Unsupported format version {version} (I support versions <={MAX_FORMAT_VERSION})"
            ),
        ));
    }

    for attr in ["Scripts", "Files"] {
        if !doc.contains_key(attr) {
            return Err(AgentError::format(
                2,
                format!("{attr} is not in the execution plan"),
            ));
        }
    }
    for attr in ["Scripts", "Files", "Options"] {
        if let Some(value) = doc.get(attr)
            && !value.is_object()
        {
            return Err(AgentError::format(2, format!("{attr} is not a dictionary")));
        }
    }

    let files = doc.get("Files").and_then(Value::as_object);
    let file_ids: Vec<&str> = files
        .map(|f| f.keys().map(String::as_str).collect())
        .unwrap_or_default();

    if let Some(scripts) = doc.get("Scripts").and_then(Value::as_object) {
        for (name, script) in scripts {
            validate_script(name, script, &version, &file_ids)?;
        }
    }

    if let Some(files) = files {
        for (key, file) in files {
            validate_file(key, file, &version)?;
        }
    }

    Ok(())
}

fn in_range(version: &Version, min: (u64, u64, u64), below: (u64, u64, u64)) -> bool {
    let min = Version::new(min.0, min.1, min.2);
    let below = Version::new(below.0, below.1, below.2);
    *version >= min && *version < below
}

fn validate_script(
    name: &str,
    script: &Value,
    version: &Version,
    file_ids: &[&str],
) -> Result<(), AgentError> {
    let script = script
        .as_object()
        .ok_or_else(|| AgentError::format(2, format!("Incorrect script entry {name}")))?;

    for attr in ["Type", "EntryPoint"] {
        if !matches!(script.get(attr), Some(Value::String(_))) {
            return Err(AgentError::format(
                2,
                format!("Incorrect {attr} entry in script {name}"),
            ));
        }
    }
    let kind = script["Type"].as_str().unwrap_or_default();
    let entry_point = script["EntryPoint"].as_str().unwrap_or_default();

    if in_range(version, (2, 0, 0), (2, 1, 0)) {
        if kind != TYPE_APPLICATION {
            return Err(AgentError::format(
                2,
                format!("Type {kind} is not valid for format {version}"),
            ));
        }
        if !file_ids.contains(&entry_point) {
            return Err(AgentError::format(
                2,
                format!("Script {name} misses entry point {entry_point}"),
            ));
        }
    }

    if *version >= Version::new(2, 1, 0) {
        if ![TYPE_APPLICATION, TYPE_CHEF, TYPE_PUPPET].contains(&kind) {
            return Err(AgentError::format(
                2,
                format!("Script has not a valid type {kind}"),
            ));
        }
        if kind == TYPE_APPLICATION {
            if !file_ids.contains(&entry_point) {
                return Err(AgentError::format(
                    2,
                    format!("Script {name} misses entry point {entry_point}"),
                ));
            }
        } else if !entry_point.contains("::") {
            return Err(AgentError::format(
                2,
                format!("Wrong EntryPoint {entry_point} for Puppet/Chef executors, :: needed"),
            ));
        }

        // A script with no Options key validates as if it were empty.
        if let Some(Value::Object(options)) = script.get("Options") {
            for option in options.keys() {
                if BERKSHELF_OPTIONS.contains(&option.as_str()) {
                    if *version < Version::new(2, 2, 0) {
                        return Err(AgentError::format(
                            2,
                            format!("Script has an option {option} invalid for version {version}"),
                        ));
                    }
                    if kind != TYPE_CHEF {
                        return Err(AgentError::format(
                            2,
                            format!("Script has an option {option} invalid for type {kind}"),
                        ));
                    }
                }
            }
        }
    }

    for file_ref in script
        .get("Files")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let resolved = match file_ref {
            Value::String(id) => file_ids.contains(&id.as_str()),
            Value::Object(alias) => alias
                .values()
                .next()
                .and_then(Value::as_str)
                .is_some_and(|id| file_ids.contains(&id)),
            _ => false,
        };
        if !resolved {
            return Err(AgentError::format(
                2,
                format!("Script {name} misses file {file_ref}"),
            ));
        }
    }

    Ok(())
}

fn validate_file(key: &str, file: &Value, version: &Version) -> Result<(), AgentError> {
    let file = file
        .as_object()
        .ok_or_else(|| AgentError::format(2, format!("Invalid file {key}")))?;

    if in_range(version, (2, 0, 0), (2, 1, 0)) {
        for attr in ["Type", "URL"] {
            if file.contains_key(attr) {
                return Err(AgentError::format(
                    2,
                    format!("Download file is {key} not valid for this version {version}"),
                ));
            }
        }
    }

    if file.contains_key("Type") {
        for attr in ["Type", "URL", "Name"] {
            if !file.contains_key(attr) {
                return Err(AgentError::format(
                    2,
                    format!("Incorrect {attr} entry in file {key}"),
                ));
            }
        }
    } else if file.contains_key("Body") {
        for attr in ["BodyType", "Body", "Name"] {
            if !file.contains_key(attr) {
                return Err(AgentError::format(
                    2,
                    format!("Incorrect {attr} entry in file {key}"),
                ));
            }
        }
        let body_type = file["BodyType"].as_str().unwrap_or_default();
        if !["Text", "Base64"].contains(&body_type) {
            return Err(AgentError::format(
                2,
                format!("Incorrect BodyType in file {key}"),
            ));
        }
    } else {
        return Err(AgentError::format(2, format!("Invalid file {key}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(version: &str) -> Value {
        json!({
            "FormatVersion": version,
            "Scripts": {},
            "Files": {},
        })
    }

    fn app_plan(version: &str) -> Value {
        json!({
            "FormatVersion": version,
            "Scripts": {
                "deploy": {
                    "Type": "Application",
                    "EntryPoint": "F1",
                    "Files": [],
                    "Options": {},
                }
            },
            "Files": {
                "F1": {"BodyType": "Text", "Body": "echo hi", "Name": "run.sh"},
            },
        })
    }

    fn code(result: Result<(), AgentError>) -> i64 {
        result.expect_err("expected a validation failure").code
    }

    #[test]
    fn accepts_max_version() {
        validate(&minimal("2.2.0")).expect("2.2.0 is supported");
    }

    #[test]
    fn rejects_versions_above_ceiling() {
        assert_eq!(code(validate(&minimal("2.2.1"))), 9);
        assert_eq!(code(validate(&minimal("1000.0.0"))), 9);
    }

    #[test]
    fn rejects_unparseable_version() {
        assert_eq!(code(validate(&minimal("two.dot.oh"))), 9);
    }

    #[test]
    fn version_defaults_to_1_0_0() {
        let plan = json!({"Scripts": {}, "Files": {}});
        validate(&plan).expect("default version is supported");
    }

    #[test]
    fn requires_scripts_and_files() {
        assert_eq!(code(validate(&json!({"Files": {}}))), 2);
        assert_eq!(code(validate(&json!({"Scripts": {}}))), 2);
    }

    #[test]
    fn rejects_non_mapping_sections() {
        assert_eq!(code(validate(&json!({"Scripts": [], "Files": {}}))), 2);
        assert_eq!(code(validate(&json!({"Scripts": {}, "Files": 3}))), 2);
        assert_eq!(
            code(validate(
                &json!({"Scripts": {}, "Files": {}, "Options": "x"})
            )),
            2
        );
    }

    #[test]
    fn accepts_application_plan() {
        validate(&app_plan("2.0.0")).expect("valid");
        validate(&app_plan("2.1.0")).expect("valid");
    }

    #[test]
    fn script_type_must_be_application_before_2_1() {
        let mut plan = app_plan("2.0.5");
        plan["Scripts"]["deploy"]["Type"] = json!("Chef");
        assert_eq!(code(validate(&plan)), 2);
    }

    #[test]
    fn chef_needs_module_reference() {
        let mut plan = app_plan("2.1.0");
        plan["Scripts"]["deploy"]["Type"] = json!("Chef");
        plan["Scripts"]["deploy"]["EntryPoint"] = json!("cookbook");
        assert_eq!(code(validate(&plan)), 2);

        plan["Scripts"]["deploy"]["EntryPoint"] = json!("cookbook::recipe");
        validate(&plan).expect("module reference with :: is valid");
    }

    #[test]
    fn unknown_script_type_rejected_at_2_1() {
        let mut plan = app_plan("2.1.0");
        plan["Scripts"]["deploy"]["Type"] = json!("Ansible");
        assert_eq!(code(validate(&plan)), 2);
    }

    #[test]
    fn entry_point_must_be_declared_file() {
        let mut plan = app_plan("2.1.0");
        plan["Scripts"]["deploy"]["EntryPoint"] = json!("F9");
        assert_eq!(code(validate(&plan)), 2);
    }

    #[test]
    fn entry_point_not_checked_below_2_0() {
        let mut plan = app_plan("1.0.0");
        plan["Scripts"]["deploy"]["EntryPoint"] = json!("F9");
        validate(&plan).expect("1.0.0 has no entry point rule");
    }

    #[test]
    fn berkshelf_option_gates() {
        let chef = |version: &str, kind: &str| {
            let mut plan = app_plan(version);
            plan["Scripts"]["deploy"]["Type"] = json!(kind);
            plan["Scripts"]["deploy"]["EntryPoint"] = json!("cookbook::recipe");
            plan["Scripts"]["deploy"]["Options"] = json!({"useBerkshelf": true});
            plan
        };

        assert_eq!(code(validate(&chef("2.1.0", "Chef"))), 2);
        assert_eq!(code(validate(&chef("2.2.0", "Puppet"))), 2);
        validate(&chef("2.2.0", "Chef")).expect("berkshelf valid for chef at 2.2.0");
    }

    #[test]
    fn script_files_must_resolve() {
        let mut plan = app_plan("2.1.0");
        plan["Scripts"]["deploy"]["Files"] = json!(["F9"]);
        assert_eq!(code(validate(&plan)), 2);

        plan["Scripts"]["deploy"]["Files"] = json!([{"alias.sh": "F9"}]);
        assert_eq!(code(validate(&plan)), 2);

        plan["Scripts"]["deploy"]["Files"] = json!(["F1", {"alias.sh": "F1"}]);
        validate(&plan).expect("both reference shapes resolve");
    }

    #[test]
    fn downloadable_rejected_before_2_1() {
        let mut plan = minimal("2.0.5");
        plan["Files"] = json!({
            "F1": {"Type": "Downloadable", "URL": "http://example.com/a", "Name": "a"},
        });
        assert_eq!(code(validate(&plan)), 2);
    }

    #[test]
    fn downloadable_requires_url_and_name() {
        let mut plan = minimal("2.1.0");
        plan["Files"] = json!({"F1": {"Type": "Downloadable", "Name": "a"}});
        assert_eq!(code(validate(&plan)), 2);
    }

    #[test]
    fn inline_file_requires_body_fields() {
        let mut plan = minimal("2.1.0");
        plan["Files"] = json!({"F1": {"Body": "hi", "Name": "a"}});
        assert_eq!(code(validate(&plan)), 2);

        plan["Files"] = json!({"F1": {"Body": "hi", "BodyType": "Binary", "Name": "a"}});
        assert_eq!(code(validate(&plan)), 2);
    }

    #[test]
    fn file_with_neither_shape_is_invalid() {
        let mut plan = minimal("2.1.0");
        plan["Files"] = json!({"F1": {"Name": "a"}});
        assert_eq!(code(validate(&plan)), 2);
    }
}
