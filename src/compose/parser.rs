//! Compose file parser

use super::config::ProjectConfig;
use crate::error::{ComposeError, Result};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Read and merge one or more compose files into a single YAML document
    pub fn load_files(paths: &[PathBuf]) -> Result<Value> {
        let mut documents = Vec::with_capacity(paths.len());

        for path in paths {
            documents.push(Self::read_file(path)?);
        }

        Self::merge_all(documents)
    }

    /// Read a single compose file
    pub fn read_file(path: &Path) -> Result<Value> {
        if !path.exists() {
            return Err(ComposeError::ConfigNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        Self::read_str(&content).map_err(|e| match e {
            ComposeError::ConfigParse { message, .. } => ComposeError::ConfigParse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Read YAML content. Keys of every document in the stream are collected
    /// into one mapping, later documents winning.
    pub fn read_str(content: &str) -> Result<Value> {
        let mut result = serde_yaml::Mapping::new();

        for document in serde_yaml::Deserializer::from_str(content) {
            let value = Value::deserialize(document).map_err(|e| ComposeError::ConfigParse {
                path: "<input>".to_string(),
                message: e.to_string(),
            })?;
            if let Value::Mapping(map) = value {
                for (key, value) in map {
                    result.insert(key, value);
                }
            }
        }

        Ok(Value::Mapping(result))
    }

    /// Parse compose content straight into a project configuration
    pub fn parse_str(content: &str) -> Result<ProjectConfig> {
        Self::parse_value(Self::read_str(content)?)
    }

    /// Deserialize a (merged, interpolated) document
    pub fn parse_value(value: Value) -> Result<ProjectConfig> {
        serde_yaml::from_value(value).map_err(|e| ComposeError::Config(e.to_string()))
    }

    /// Merge documents in order
    pub fn merge_all(documents: Vec<Value>) -> Result<Value> {
        let mut documents = documents.into_iter();
        let mut base = documents.next().unwrap_or(Value::Mapping(Default::default()));

        for overlay in documents {
            base = Self::merge_values(base, overlay)?;
        }

        Ok(base)
    }

    /// Merge `overlay` into `base`.
    ///
    /// Mappings merge recursively; a value of the same type in the overlay
    /// replaces the base value; differing types are a conflict.
    pub fn merge_values(base: Value, overlay: Value) -> Result<Value> {
        match (base, overlay) {
            (Value::Mapping(mut base), Value::Mapping(overlay)) => {
                for (key, value) in overlay {
                    match base.get_mut(&key) {
                        Some(existing) => {
                            let current = std::mem::replace(existing, Value::Null);
                            *existing = Self::merge_entry(&key, current, value)?;
                        }
                        None => {
                            base.insert(key, value);
                        }
                    }
                }
                Ok(Value::Mapping(base))
            }
            (_, overlay) => Ok(overlay),
        }
    }

    fn merge_entry(key: &Value, existing: Value, value: Value) -> Result<Value> {
        match (&existing, &value) {
            (Value::Mapping(_), Value::Mapping(_)) => Self::merge_values(existing, value),
            (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => Ok(value),
            _ => Err(ComposeError::MergeConflict(key_name(key))),
        }
    }

    /// Validate semantic rules of a loaded configuration.
    ///
    /// Returns non-fatal warnings; any violation is a configuration error.
    pub fn validate(config: &ProjectConfig, working_dir: &Path) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.instances.is_empty() {
            return Err(ComposeError::Config("no instances are defined".to_string()));
        }

        for (name, service) in &config.instances {
            match (&service.image, &service.build) {
                (None, None) => {
                    return Err(ComposeError::Config(format!(
                        "build or image must be defined for {}",
                        name
                    )));
                }
                (Some(_), Some(_)) => {
                    return Err(ComposeError::Config(format!(
                        "only one of build or image may be defined for {}",
                        name
                    )));
                }
                (None, Some(build)) => {
                    let context = working_dir.join(&build.context);
                    if !context.is_dir() {
                        return Err(ComposeError::Config(format!(
                            "build.context {} does not exist.",
                            build.context
                        )));
                    }
                    if !context.join(&build.recipe).exists() {
                        return Err(ComposeError::Config(format!(
                            "{} does not exist in {}",
                            build.recipe, build.context
                        )));
                    }
                }
                (Some(_), None) => {}
            }

            for dep in &service.depends_on {
                if !config.instances.contains_key(dep) {
                    return Err(ComposeError::Config(format!(
                        "Instance '{}' depends on unknown instance '{}'",
                        name, dep
                    )));
                }
            }

            for source in &service.volumes_from {
                if !config.instances.contains_key(source) {
                    return Err(ComposeError::Config(format!(
                        "{} not in config is specified to get volumes from.",
                        source
                    )));
                }
            }

            if let Some(replicas) = service.deploy.as_ref().and_then(|d| d.replicas) {
                if replicas == 0 {
                    return Err(ComposeError::Config(format!(
                        "deploy.replicas for {} must be at least 1",
                        name
                    )));
                }
                if replicas > 1 {
                    warnings.push(format!(
                        "Instance '{}' requests {} replicas; a single instance will be started",
                        name, replicas
                    ));
                }
            }

            if !service.network.enable && !service.ports.is_empty() {
                warnings.push(format!(
                    "Instance '{}' publishes ports but has networking disabled",
                    name
                ));
            }
        }

        Ok(warnings)
    }

    /// Collect the interpolation environment: the process environment,
    /// overlaid with an optional env file
    pub fn environment(env_file: Option<&Path>) -> Result<HashMap<String, String>> {
        let mut env: HashMap<String, String> = std::env::vars().collect();

        if let Some(path) = env_file {
            if !path.exists() {
                return Err(ComposeError::ConfigNotFound(path.to_path_buf()));
            }
            env.extend(Self::parse_env_file(&std::fs::read_to_string(path)?));
        }

        Ok(env)
    }

    /// Parse `KEY=VALUE` lines
    pub fn parse_env_file(content: &str) -> HashMap<String, String> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let line = line.strip_prefix("export ").unwrap_or(line);
                let (key, value) = line.split_once('=')?;
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                    .unwrap_or(value);
                Some((key.trim().to_string(), value.to_string()))
            })
            .collect()
    }

    /// Interpolate environment variables in every string of the document
    pub fn interpolate(value: &mut Value, env: &HashMap<String, String>) {
        match value {
            Value::String(s) => *s = interpolate_string(s, env),
            Value::Sequence(seq) => {
                for item in seq {
                    Self::interpolate(item, env);
                }
            }
            Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    Self::interpolate(item, env);
                }
            }
            Value::Tagged(tagged) => Self::interpolate(&mut tagged.value, env),
            _ => {}
        }
    }
}

fn key_name(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim()
            .to_string(),
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable pattern is valid")
    })
}

/// Interpolate `${VAR}`, `${VAR:-default}` and `$VAR`. Unknown variables
/// without a default are left as written; `$$` is a literal dollar.
fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(s, |caps: &regex::Captures| {
            if let Some(var) = caps.get(1) {
                return env
                    .get(var.as_str())
                    .cloned()
                    .or_else(|| caps.get(2).map(|d| d.as_str().to_string()))
                    .unwrap_or_else(|| caps[0].to_string());
            }
            if let Some(var) = caps.get(3) {
                return env
                    .get(var.as_str())
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string());
            }
            "$".to_string()
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_simple_compose() {
        let content = r#"
version: "2.0"
instances:
  web:
    image: docker://nginx
    ports:
      - "80"
  db:
    image: docker://postgres
"#;

        let config = ComposeParser::parse_str(content).unwrap();
        assert_eq!(config.version.as_deref(), Some("2.0"));
        assert_eq!(config.names(), vec!["web", "db"]);
    }

    #[test]
    fn test_merge_scalars_and_mappings() {
        let merged = ComposeParser::merge_values(yaml("a: 123"), yaml("b: 456")).unwrap();
        assert_eq!(merged, yaml("{a: 123, b: 456}"));

        let merged = ComposeParser::merge_values(yaml("a: 123"), yaml("{b: 456, a: 789}")).unwrap();
        assert_eq!(merged, yaml("{a: 789, b: 456}"));

        let merged =
            ComposeParser::merge_values(yaml("{a: 123, b: {c: d}}"), yaml("{b: {e: f}}")).unwrap();
        assert_eq!(merged, yaml("{a: 123, b: {c: d, e: f}}"));

        let merged =
            ComposeParser::merge_values(yaml("{a: 123, b: {c: d}}"), yaml("{b: {c: f}}")).unwrap();
        assert_eq!(merged, yaml("{a: 123, b: {c: f}}"));
    }

    #[test]
    fn test_merge_type_mismatch() {
        let result = ComposeParser::merge_values(yaml("{a: {b: x}}"), yaml("{a: {b: [x]}}"));
        match result {
            Err(ComposeError::MergeConflict(key)) => assert_eq!(key, "b"),
            other => panic!("expected merge conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_load_files_merges_in_order() {
        let temp = tempdir().unwrap();
        let first = temp.path().join("one.yml");
        let second = temp.path().join("two.yml");
        std::fs::write(
            &first,
            "version: \"2.0\"\ninstances:\n  echo:\n    image: docker://busybox\n    start:\n      args: \"arg0 arg1\"\n",
        )
        .unwrap();
        std::fs::write(
            &second,
            "instances:\n  echo:\n    start:\n      args: \"arg2\"\n  other:\n    image: docker://alpine\n",
        )
        .unwrap();

        let merged = ComposeParser::load_files(&[first, second]).unwrap();
        let config = ComposeParser::parse_value(merged).unwrap();
        assert_eq!(config.names(), vec!["echo", "other"]);
        let echo = config.get("echo").unwrap();
        assert_eq!(echo.image.as_deref(), Some("docker://busybox"));
        assert_eq!(echo.start.args.as_ref().unwrap().to_string(), "arg2");
    }

    #[test]
    fn test_missing_file() {
        let temp = tempdir().unwrap();
        let result = ComposeParser::load_files(&[temp.path().join("nope.yml")]);
        assert!(matches!(result, Err(ComposeError::ConfigNotFound(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ComposeParser::read_str("instances: [unclosed");
        assert!(matches!(result, Err(ComposeError::ConfigParse { .. })));
    }

    #[test]
    fn test_validate_missing_image() {
        let config = ComposeParser::parse_str(
            "version: \"2.0\"\ninstances:\n  web:\n    ports:\n      - \"80\"\n",
        )
        .unwrap();
        let temp = tempdir().unwrap();
        let err = ComposeParser::validate(&config, temp.path()).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let config = ComposeParser::parse_str(
            "instances:\n  app:\n    image: docker://nginx\n    depends_on:\n      - db\n",
        )
        .unwrap();
        let temp = tempdir().unwrap();
        let err = ComposeParser::validate(&config, temp.path()).unwrap_err();
        assert!(err.to_string().contains("unknown instance 'db'"));
    }

    #[test]
    fn test_validate_unknown_volumes_from() {
        let config = ComposeParser::parse_str(
            "instances:\n  app:\n    image: docker://nginx\n    volumes_from:\n      - data\n",
        )
        .unwrap();
        let temp = tempdir().unwrap();
        assert!(ComposeParser::validate(&config, temp.path()).is_err());
    }

    #[test]
    fn test_validate_build_context() {
        let temp = tempdir().unwrap();
        let config = ComposeParser::parse_str(
            "instances:\n  app:\n    build:\n      context: app\n      recipe: Singularity.app\n",
        )
        .unwrap();

        assert!(ComposeParser::validate(&config, temp.path()).is_err());

        std::fs::create_dir(temp.path().join("app")).unwrap();
        assert!(ComposeParser::validate(&config, temp.path()).is_err());

        std::fs::write(temp.path().join("app/Singularity.app"), "Bootstrap: docker\n").unwrap();
        assert!(ComposeParser::validate(&config, temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_validate_replicas_warning() {
        let temp = tempdir().unwrap();
        let config = ComposeParser::parse_str(
            "instances:\n  app:\n    image: docker://nginx\n    deploy:\n      replicas: 3\n",
        )
        .unwrap();
        let warnings = ComposeParser::validate(&config, temp.path()).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_interpolate() {
        let mut env = HashMap::new();
        env.insert("TAG".to_string(), "1.0.0".to_string());

        assert_eq!(interpolate_string("nginx:${TAG}", &env), "nginx:1.0.0");
        assert_eq!(interpolate_string("nginx:$TAG", &env), "nginx:1.0.0");
        assert_eq!(interpolate_string("${MISSING:-latest}", &env), "latest");
        assert_eq!(interpolate_string("echo $HOME_X", &env), "echo $HOME_X");
        assert_eq!(interpolate_string("cost $$5", &env), "cost $5");
    }

    #[test]
    fn test_interpolate_document() {
        let mut env = HashMap::new();
        env.insert("IMAGE".to_string(), "docker://redis".to_string());
        let mut doc = yaml("instances:\n  cache:\n    image: ${IMAGE}\n    ports: [\"${PORT:-6379}\"]\n");

        ComposeParser::interpolate(&mut doc, &env);
        let config = ComposeParser::parse_value(doc).unwrap();
        let cache = config.get("cache").unwrap();
        assert_eq!(cache.image.as_deref(), Some("docker://redis"));
        assert_eq!(cache.ports, vec!["6379"]);
    }

    #[test]
    fn test_parse_env_file() {
        let env = ComposeParser::parse_env_file(
            "# comment\nA=1\nexport B=\"two words\"\n\nC='x'\nnot a pair\n",
        );
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("two words"));
        assert_eq!(env.get("C").map(String::as_str), Some("x"));
        assert_eq!(env.len(), 3);
    }
}
