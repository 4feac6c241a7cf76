//! Container runtime collaborator
//!
//! The orchestration core never builds images or starts processes itself.
//! Everything that touches a real container goes through [`ContainerRuntime`].

pub mod memory;
pub mod singularity;

pub use memory::{InMemoryRuntime, RuntimeCall};
pub use singularity::SingularityCli;

use crate::error::Result;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An instance as reported by the runtime's process list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    /// Instance name
    pub name: String,
    /// Process ID of the instance
    pub pid: Option<u32>,
    /// Bridge address, when the instance has one
    pub ip: Option<Ipv4Addr>,
    /// Image the instance was started from
    pub image: PathBuf,
}

/// Handle to a started instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    /// Instance name
    pub name: String,
    /// Whether the instance was started with elevated privileges
    pub privileged: bool,
    /// Process ID, when known
    pub pid: Option<u32>,
}

impl RuntimeHandle {
    /// `instance://` URI of the handle
    pub fn uri(&self) -> String {
        format!("instance://{}", self.name)
    }
}

/// Request to build an image from a recipe
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Artifact to produce
    pub image: PathBuf,
    /// Recipe file name, relative to the context
    pub recipe: String,
    /// Directory the build runs in
    pub context: PathBuf,
    /// Build flags
    pub options: Vec<String>,
    /// Run the build with elevated privileges
    pub privileged: bool,
}

/// Request to start an instance
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Instance name
    pub name: String,
    /// Image to start
    pub image: PathBuf,
    /// Start options (binds, network, hostname, ...)
    pub options: Vec<String>,
    /// Arguments for the startscript
    pub args: Vec<String>,
    /// Start with elevated privileges
    pub privileged: bool,
}

/// Exit status and output lines of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status
    pub status: i32,
    /// Captured standard output lines
    pub stdout: Vec<String>,
    /// Captured standard error lines
    pub stderr: Vec<String>,
}

impl CommandOutput {
    /// Whether the command exited with status zero
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Standard output followed by standard error, for diagnostics
    pub fn text(&self) -> String {
        self.stdout
            .iter()
            .chain(&self.stderr)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Operations the orchestrator needs from a container runtime
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime {
    /// Name of the runtime program, used in suggestions to the user
    fn program(&self) -> &str;

    /// Build an image. A non-zero status is reported in the output, not as
    /// an error.
    async fn build(&self, request: &BuildRequest) -> Result<CommandOutput>;

    /// Pull `uri` into `dest`
    async fn pull(&self, uri: &str, dest: &Path) -> Result<()>;

    /// Start an instance
    async fn start_instance(&self, request: &StartRequest) -> Result<RuntimeHandle>;

    /// Stop an instance, force-killing it once `timeout` elapses
    async fn stop_instance(&self, handle: &RuntimeHandle, timeout: Option<Duration>) -> Result<()>;

    /// Instances currently running as the calling user (or root)
    async fn list_instances(&self, privileged: bool) -> Result<Vec<InstanceInfo>>;

    /// Execute a command in a running instance, streaming its output
    async fn exec(
        &self,
        handle: &RuntimeHandle,
        command: &[String],
        options: &[String],
    ) -> Result<CommandOutput>;

    /// Run the runscript of a running instance, streaming its output
    async fn run(
        &self,
        handle: &RuntimeHandle,
        args: &[String],
        options: &[String],
    ) -> Result<CommandOutput>;

    /// Open an interactive shell in a running instance
    async fn shell(&self, handle: &RuntimeHandle) -> Result<i32>;

    /// Run a command on the host, capturing its output
    async fn host_command(&self, command: &[String], cwd: &Path) -> Result<CommandOutput>;

    /// Directory holding the `<name>.out` / `<name>.err` instance logs
    fn log_dir(&self, privileged: bool) -> PathBuf;
}
