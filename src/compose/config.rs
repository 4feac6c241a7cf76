//! Compose file configuration types

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Default compose file name
pub const DEFAULT_COMPOSE_FILE: &str = "singularity-compose.yml";

/// Recipe file looked up inside a build context when none is given
pub const DEFAULT_RECIPE: &str = "Singularity";

/// Start options that let an instance bind ports without root
const UNPRIVILEGED_START_OPTIONS: &[&str] = &["fakeroot", "f", "remote"];

/// Spellings of the fakeroot start option
const FAKEROOT_START_OPTIONS: &[&str] = &["fakeroot", "f"];

/// A compose project configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Compose file version
    #[serde(default)]
    pub version: Option<String>,
    /// Instances, in declaration order
    #[serde(default)]
    pub instances: IndexMap<String, ServiceSpec>,
}

impl ProjectConfig {
    /// Instance names in declaration order
    pub fn names(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    /// Look up an instance by name
    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.instances.get(name)
    }

    /// Whether the project needs a privileged runtime.
    ///
    /// Publishing ports requires root unless the instance is started with
    /// fakeroot (or remotely).
    pub fn requires_privilege(&self) -> bool {
        self.instances
            .values()
            .any(|service| !service.ports.is_empty() && !service.start.is_unprivileged())
    }
}

/// Configuration of a single instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Image reference, either a local path or a pull-able URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    /// Networking
    #[serde(default)]
    pub network: NetworkSpec,
    /// Ports to publish
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Bind mounts, `src:dst[:opts]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// Instances whose volumes are shared with this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,
    /// Instances that must be created first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Instance start arguments and options
    #[serde(default)]
    pub start: StartSpec,
    /// Command executed in the instance once it is started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecSpec>,
    /// Runscript invocation after start (and exec). A bare `run:` enables
    /// it without arguments.
    #[serde(
        default,
        deserialize_with = "enabled_run",
        skip_serializing_if = "Option::is_none"
    )]
    pub run: Option<RunSpec>,
    /// Host command run after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<PostSpec>,
    /// Deploy configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeploySpec>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build context directory
    pub context: String,
    /// Recipe file inside the context
    #[serde(default = "default_recipe")]
    pub recipe: String,
    /// Build options
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<BuildOption>,
}

fn default_recipe() -> String {
    DEFAULT_RECIPE.to_string()
}

impl BuildSpec {
    /// Translate options into runtime command line flags.
    ///
    /// A bare string is a boolean flag. In a mapping, `true` becomes a flag,
    /// `false` is dropped and anything else becomes `--key value`.
    pub fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();

        for option in &self.options {
            match option {
                BuildOption::Flag(name) => flags.push(format!("--{}", name)),
                BuildOption::Map(map) => {
                    for (key, value) in map {
                        match value {
                            serde_yaml::Value::Bool(true) => flags.push(format!("--{}", key)),
                            serde_yaml::Value::Bool(false) => {}
                            serde_yaml::Value::String(s) => {
                                flags.push(format!("--{}", key));
                                flags.push(s.clone());
                            }
                            serde_yaml::Value::Number(n) => {
                                flags.push(format!("--{}", key));
                                flags.push(n.to_string());
                            }
                            serde_yaml::Value::Null => flags.push(format!("--{}", key)),
                            other => {
                                flags.push(format!("--{}", key));
                                flags.push(
                                    serde_yaml::to_string(other)
                                        .unwrap_or_default()
                                        .trim()
                                        .to_string(),
                                );
                            }
                        }
                    }
                }
            }
        }

        flags
    }
}

/// A single build option
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildOption {
    /// Boolean flag, e.g. `fakeroot`
    Flag(String),
    /// Flags with values, e.g. `{sandbox: true, section: setup}`
    Map(IndexMap<String, serde_yaml::Value>),
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Enable networking
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Pass the allocated address to the runtime
    #[serde(default = "default_true")]
    pub allocate_ip: bool,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            enable: true,
            allocate_ip: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Instance start configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSpec {
    /// Arguments passed to the startscript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<CommandLine>,
    /// Options, written without leading dashes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl StartSpec {
    /// Options as command line flags
    pub fn flags(&self) -> Vec<String> {
        option_flags(&self.options)
    }

    /// Whether the instance runs without needing root for networking
    pub fn is_unprivileged(&self) -> bool {
        self.options
            .iter()
            .any(|opt| UNPRIVILEGED_START_OPTIONS.contains(&opt.as_str()))
    }

    /// Whether the instance is started with fakeroot
    pub fn is_fakeroot(&self) -> bool {
        self.options
            .iter()
            .any(|opt| FAKEROOT_START_OPTIONS.contains(&opt.as_str()))
    }
}

/// Exec hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSpec {
    /// Command to execute
    pub command: CommandLine,
    /// Exec options
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Run hook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSpec {
    /// Arguments to the runscript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<CommandLine>,
    /// Run options
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

fn enabled_run<'de, D>(deserializer: D) -> std::result::Result<Option<RunSpec>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(
        Option::<RunSpec>::deserialize(deserializer)?.unwrap_or_default(),
    ))
}

/// Post-create hook, executed on the host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostSpec {
    /// Command to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandLine>,
}

/// Deploy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploySpec {
    /// Number of replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
}

/// A command given either as one string or as a list of arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Shell-like string, split on whitespace honouring quotes
    Line(String),
    /// Explicit argument list
    Args(Vec<String>),
}

impl CommandLine {
    /// Split into arguments
    pub fn to_args(&self) -> Vec<String> {
        match self {
            CommandLine::Line(line) => split_command_line(line),
            CommandLine::Args(args) => args.clone(),
        }
    }

    /// Whether the command contains a pipe
    pub fn has_pipe(&self) -> bool {
        match self {
            CommandLine::Line(line) => line.contains('|'),
            CommandLine::Args(args) => args.iter().any(|a| a.contains('|')),
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLine::Line(line) => write!(f, "{}", line),
            CommandLine::Args(args) => write!(f, "{}", args.join(" ")),
        }
    }
}

/// Turn option names into flags: single letters get one dash, words two
pub fn option_flags(options: &[String]) -> Vec<String> {
    options
        .iter()
        .map(|opt| {
            if opt.starts_with('-') {
                opt.clone()
            } else if opt.chars().count() > 1 {
                format!("--{}", opt)
            } else {
                format!("-{}", opt)
            }
        })
        .collect()
}

/// Split a command string into words, honouring single and double quotes
/// and backslash escapes
fn split_command_line(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if in_word {
        words.push(current);
    }

    words
}
