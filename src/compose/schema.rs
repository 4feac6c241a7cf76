//! Structural validation of compose documents

use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::sync::OnceLock;

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Dotted path of the offending value
    pub path: String,
    /// What is wrong with it
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Clone, Copy)]
enum Kind {
    String,
    Bool,
    StringList,
    /// A string or a list of strings
    Command,
    /// A string flag or a mapping of flags
    BuildOptions,
    Replicas,
}

const BUILD_FIELDS: &[(&str, Kind)] = &[
    ("context", Kind::String),
    ("recipe", Kind::String),
    ("options", Kind::BuildOptions),
];
const NETWORK_FIELDS: &[(&str, Kind)] = &[("enable", Kind::Bool), ("allocate_ip", Kind::Bool)];
const START_FIELDS: &[(&str, Kind)] = &[("args", Kind::Command), ("options", Kind::StringList)];
const EXEC_FIELDS: &[(&str, Kind)] = &[("command", Kind::Command), ("options", Kind::StringList)];
const RUN_FIELDS: &[(&str, Kind)] = &[("args", Kind::Command), ("options", Kind::StringList)];
const POST_FIELDS: &[(&str, Kind)] = &[("command", Kind::Command)];
const DEPLOY_FIELDS: &[(&str, Kind)] = &[("replicas", Kind::Replicas)];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\w[\w-]*$").expect("name pattern is valid"))
}

/// Validates the shape of a compose document before it is deserialized
pub struct SchemaValidator;

impl SchemaValidator {
    /// Every violation in `document`, in document order
    pub fn validate(document: &Value) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();

        let Some(root) = document.as_mapping() else {
            violations.push(violation("$", "document must be a mapping"));
            return violations;
        };

        for required in ["version", "instances"] {
            if !root.contains_key(required) {
                violations.push(violation("$", &format!("'{}' is a required property", required)));
            }
        }

        for (key, value) in root {
            match key.as_str() {
                Some("version") => {
                    if !value.is_string() {
                        violations.push(violation("version", "must be a string"));
                    }
                }
                Some("instances") => Self::check_instances(value, &mut violations),
                _ => violations.push(violation(
                    "$",
                    &format!("additional property {} is not allowed", key_label(key)),
                )),
            }
        }

        violations
    }

    /// Whether `document` has no violations
    pub fn is_valid(document: &Value) -> bool {
        Self::validate(document).is_empty()
    }

    fn check_instances(value: &Value, violations: &mut Vec<SchemaViolation>) {
        let Some(instances) = value.as_mapping() else {
            violations.push(violation("instances", "must be a mapping"));
            return;
        };

        for (name, instance) in instances {
            let label = key_label(name);
            let path = format!("instances.{}", label);

            if !name.as_str().is_some_and(|n| name_pattern().is_match(n)) {
                violations.push(violation(&path, "invalid instance name"));
            }

            let Some(instance) = instance.as_mapping() else {
                violations.push(violation(&path, "must be a mapping"));
                continue;
            };

            Self::check_instance(&path, instance, violations);
        }
    }

    fn check_instance(path: &str, instance: &Mapping, violations: &mut Vec<SchemaViolation>) {
        for (key, value) in instance {
            let Some(field) = key.as_str() else {
                continue;
            };
            let field_path = format!("{}.{}", path, field);

            match field {
                "image" => check_kind(&field_path, value, Kind::String, violations),
                "ports" | "volumes" | "volumes_from" | "depends_on" => {
                    check_kind(&field_path, value, Kind::StringList, violations)
                }
                "build" => check_group(&field_path, value, BUILD_FIELDS, &[], violations),
                "network" => check_group(&field_path, value, NETWORK_FIELDS, &[], violations),
                "start" => check_group(&field_path, value, START_FIELDS, &[], violations),
                "exec" => check_group(&field_path, value, EXEC_FIELDS, &["command"], violations),
                "run" => {
                    // an empty `run:` only enables the runscript
                    if !value.is_null() {
                        check_group(&field_path, value, RUN_FIELDS, &[], violations)
                    }
                }
                "post" => check_group(&field_path, value, POST_FIELDS, &[], violations),
                "deploy" => check_group(&field_path, value, DEPLOY_FIELDS, &[], violations),
                _ => {}
            }
        }
    }
}

fn check_group(
    path: &str,
    value: &Value,
    fields: &[(&str, Kind)],
    required: &[&str],
    violations: &mut Vec<SchemaViolation>,
) {
    let Some(group) = value.as_mapping() else {
        violations.push(violation(path, "must be a mapping"));
        return;
    };

    for field in required {
        if !group.contains_key(*field) {
            violations.push(violation(path, &format!("'{}' is a required property", field)));
        }
    }

    for (name, kind) in fields {
        if let Some(value) = group.get(*name) {
            check_kind(&format!("{}.{}", path, name), value, *kind, violations);
        }
    }
}

fn check_kind(path: &str, value: &Value, kind: Kind, violations: &mut Vec<SchemaViolation>) {
    let message = match kind {
        Kind::String if !value.is_string() => "must be a string",
        Kind::Bool if !value.is_bool() => "must be a boolean",
        Kind::StringList if !is_string_list(value) => "must be a list of strings",
        Kind::Command if !value.is_string() && !is_string_list(value) => {
            "must be a string or a list of strings"
        }
        Kind::BuildOptions if !is_build_options(value) => {
            "must be a list of flags or flag mappings"
        }
        Kind::Replicas if !value.as_u64().is_some_and(|n| n >= 1) => {
            "must be a number of at least 1"
        }
        _ => return,
    };

    violations.push(violation(path, message));
}

fn is_string_list(value: &Value) -> bool {
    value
        .as_sequence()
        .is_some_and(|items| items.iter().all(Value::is_string))
}

fn is_build_options(value: &Value) -> bool {
    value
        .as_sequence()
        .is_some_and(|items| items.iter().all(|item| item.is_string() || item.is_mapping()))
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim()
            .to_string(),
    }
}

fn violation(path: &str, message: &str) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.to_string(),
    }
}
