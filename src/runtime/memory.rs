//! In-process runtime that records calls instead of running them

use super::{
    BuildRequest, CommandOutput, ContainerRuntime, InstanceInfo, RuntimeHandle, StartRequest,
};
use crate::error::{ComposeError, Result};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A call received by [`InMemoryRuntime`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Build {
        image: PathBuf,
        options: Vec<String>,
        privileged: bool,
    },
    Pull {
        uri: String,
        dest: PathBuf,
    },
    Start {
        name: String,
        options: Vec<String>,
        args: Vec<String>,
    },
    Stop {
        name: String,
        timeout: Option<Duration>,
    },
    Exec {
        name: String,
        command: Vec<String>,
    },
    Run {
        name: String,
        args: Vec<String>,
    },
    Shell {
        name: String,
    },
    Host {
        command: Vec<String>,
    },
}

impl RuntimeCall {
    /// Instance name the call targets, if any
    pub fn instance(&self) -> Option<&str> {
        match self {
            RuntimeCall::Start { name, .. }
            | RuntimeCall::Stop { name, .. }
            | RuntimeCall::Exec { name, .. }
            | RuntimeCall::Run { name, .. }
            | RuntimeCall::Shell { name } => Some(name),
            _ => None,
        }
    }
}

#[derive(Default)]
struct State {
    calls: Vec<RuntimeCall>,
    running: IndexMap<String, InstanceInfo>,
    failing_builds: HashSet<PathBuf>,
    host_status: i32,
    exec_status: i32,
    next_pid: u32,
}

/// Runtime double used by tests.
///
/// Builds and pulls write a placeholder artifact so existence checks behave
/// as they would against the real runtime.
pub struct InMemoryRuntime {
    state: Mutex<State>,
    log_dir: PathBuf,
}

impl InMemoryRuntime {
    /// Create a runtime whose instance logs live under `log_dir`
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(State {
                next_pid: 1000,
                ..State::default()
            }),
            log_dir: log_dir.into(),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| ComposeError::Lock(e.to_string()))
    }

    /// Make builds producing `image` exit with a non-zero status
    pub fn fail_build(&self, image: impl Into<PathBuf>) -> Result<()> {
        self.state()?.failing_builds.insert(image.into());
        Ok(())
    }

    /// Exit status returned by host commands
    pub fn set_host_status(&self, status: i32) -> Result<()> {
        self.state()?.host_status = status;
        Ok(())
    }

    /// Exit status returned by exec
    pub fn set_exec_status(&self, status: i32) -> Result<()> {
        self.state()?.exec_status = status;
        Ok(())
    }

    /// Register an instance as already running
    pub fn add_running(&self, info: InstanceInfo) -> Result<()> {
        self.state()?.running.insert(info.name.clone(), info);
        Ok(())
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Result<Vec<RuntimeCall>> {
        Ok(self.state()?.calls.clone())
    }

    /// Names of running instances, in start order
    pub fn running_names(&self) -> Result<Vec<String>> {
        Ok(self.state()?.running.keys().cloned().collect())
    }

    fn network_address(options: &[String]) -> Option<std::net::Ipv4Addr> {
        options
            .iter()
            .find_map(|opt| opt.strip_prefix("IP="))
            .and_then(|ip| ip.parse().ok())
    }
}

impl ContainerRuntime for InMemoryRuntime {
    fn program(&self) -> &str {
        "singularity"
    }

    async fn build(&self, request: &BuildRequest) -> Result<CommandOutput> {
        let mut state = self.state()?;
        state.calls.push(RuntimeCall::Build {
            image: request.image.clone(),
            options: request.options.clone(),
            privileged: request.privileged,
        });

        if state.failing_builds.contains(&request.image) {
            return Ok(CommandOutput {
                status: 255,
                stdout: Vec::new(),
                stderr: vec!["FATAL: build failed".to_string()],
            });
        }

        std::fs::write(&request.image, b"SIF")?;
        Ok(CommandOutput::default())
    }

    async fn pull(&self, uri: &str, dest: &Path) -> Result<()> {
        self.state()?.calls.push(RuntimeCall::Pull {
            uri: uri.to_string(),
            dest: dest.to_path_buf(),
        });
        std::fs::write(dest, b"SIF")?;
        Ok(())
    }

    async fn start_instance(&self, request: &StartRequest) -> Result<RuntimeHandle> {
        let mut state = self.state()?;
        state.calls.push(RuntimeCall::Start {
            name: request.name.clone(),
            options: request.options.clone(),
            args: request.args.clone(),
        });

        if state.running.contains_key(&request.name) {
            return Err(ComposeError::RuntimeCommand {
                command: format!("instance start {}", request.name),
                status: 255,
            });
        }

        state.next_pid += 1;
        let pid = state.next_pid;
        state.running.insert(
            request.name.clone(),
            InstanceInfo {
                name: request.name.clone(),
                pid: Some(pid),
                ip: Self::network_address(&request.options),
                image: request.image.clone(),
            },
        );

        Ok(RuntimeHandle {
            name: request.name.clone(),
            privileged: request.privileged,
            pid: Some(pid),
        })
    }

    async fn stop_instance(&self, handle: &RuntimeHandle, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state()?;
        state.calls.push(RuntimeCall::Stop {
            name: handle.name.clone(),
            timeout,
        });

        if state.running.shift_remove(&handle.name).is_none() {
            return Err(ComposeError::InstanceNotRunning(handle.name.clone()));
        }
        Ok(())
    }

    async fn list_instances(&self, _privileged: bool) -> Result<Vec<InstanceInfo>> {
        Ok(self.state()?.running.values().cloned().collect())
    }

    async fn exec(
        &self,
        handle: &RuntimeHandle,
        command: &[String],
        _options: &[String],
    ) -> Result<CommandOutput> {
        let mut state = self.state()?;
        state.calls.push(RuntimeCall::Exec {
            name: handle.name.clone(),
            command: command.to_vec(),
        });
        Ok(CommandOutput {
            status: state.exec_status,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    async fn run(
        &self,
        handle: &RuntimeHandle,
        args: &[String],
        _options: &[String],
    ) -> Result<CommandOutput> {
        self.state()?.calls.push(RuntimeCall::Run {
            name: handle.name.clone(),
            args: args.to_vec(),
        });
        Ok(CommandOutput::default())
    }

    async fn shell(&self, handle: &RuntimeHandle) -> Result<i32> {
        self.state()?.calls.push(RuntimeCall::Shell {
            name: handle.name.clone(),
        });
        Ok(0)
    }

    async fn host_command(&self, command: &[String], _cwd: &Path) -> Result<CommandOutput> {
        let mut state = self.state()?;
        state.calls.push(RuntimeCall::Host {
            command: command.to_vec(),
        });
        Ok(CommandOutput {
            status: state.host_status,
            stdout: vec![format!("ran {}", command.join(" "))],
            stderr: Vec::new(),
        })
    }

    fn log_dir(&self, _privileged: bool) -> PathBuf {
        self.log_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_start_records_address() {
        let temp = tempdir().unwrap();
        let runtime = InMemoryRuntime::new(temp.path());

        let handle = runtime
            .start_instance(&StartRequest {
                name: "app".to_string(),
                image: temp.path().join("app.sif"),
                options: vec!["--network-args".to_string(), "IP=10.22.0.2".to_string()],
                args: Vec::new(),
                privileged: false,
            })
            .await
            .unwrap();

        assert_eq!(handle.name, "app");
        let listed = runtime.list_instances(false).await.unwrap();
        assert_eq!(listed[0].ip, Some("10.22.0.2".parse().unwrap()));

        runtime.stop_instance(&handle, None).await.unwrap();
        assert!(runtime.running_names().unwrap().is_empty());
        assert!(matches!(
            runtime.stop_instance(&handle, None).await,
            Err(ComposeError::InstanceNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_build_writes_nothing() {
        let temp = tempdir().unwrap();
        let runtime = InMemoryRuntime::new(temp.path());
        let image = temp.path().join("app.sif");
        runtime.fail_build(&image).unwrap();

        let output = runtime
            .build(&BuildRequest {
                image: image.clone(),
                recipe: "Singularity".to_string(),
                context: temp.path().to_path_buf(),
                options: Vec::new(),
                privileged: true,
            })
            .await
            .unwrap();

        assert!(!output.success());
        assert!(!image.exists());
        assert_eq!(runtime.calls().unwrap().len(), 1);
    }
}
