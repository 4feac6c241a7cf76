//! Error types for scompose

use std::path::PathBuf;
use thiserror::Error;

/// Result type for scompose operations
pub type Result<T> = std::result::Result<T, ComposeError>;

/// scompose error types
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("{} does not exist.", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Cannot parse {path}, invalid yaml: {message}")]
    ConfigParse { path: String, message: String },

    #[error("key '{0}': type mismatch in different files.")]
    MergeConflict(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0} is not a valid instance name.")]
    UnknownInstance(String),

    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("{service} depends on {dependency}, which is neither running nor requested")]
    MissingDependency { service: String, dependency: String },

    #[error("Invalid bridge CIDR: {0}")]
    InvalidCidr(String),

    #[error("Address pool {cidr} exhausted while assigning {instance}")]
    AddressPoolExhausted { cidr: String, instance: String },

    #[error("bind source file {0} does not exist")]
    BindSourceNotFound(String),

    #[error("{0} is an invalid unique resource identifier.")]
    InvalidImageReference(String),

    #[error("Pipes are not currently supported ({instance} {hook}).")]
    UnsupportedPipe { instance: String, hook: String },

    #[error("Image {} not found, please run build first.", .0.display())]
    ImageNotBuilt(PathBuf),

    #[error("Issue building {instance}, try: {suggestion}")]
    BuildExecution { instance: String, suggestion: String },

    #[error("Post command for {instance} returned {status}: {output}")]
    PostHook {
        instance: String,
        status: i32,
        output: String,
    },

    #[error("Command `{command}` had non zero exit status {status}")]
    RuntimeCommand { command: String, status: i32 },

    #[error("Cannot find {0}, is it up?")]
    InstanceNotRunning(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComposeError {
    /// True for errors raised while loading or validating configuration,
    /// before any runtime interaction.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ComposeError::ConfigNotFound(_)
                | ComposeError::ConfigParse { .. }
                | ComposeError::MergeConflict(_)
                | ComposeError::Config(_)
                | ComposeError::UnknownInstance(_)
        )
    }
}
