//! Runtime binding that drives the `singularity` command line

use super::{
    BuildRequest, CommandOutput, ContainerRuntime, InstanceInfo, RuntimeHandle, StartRequest,
};
use crate::error::{ComposeError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Default runtime program
pub const DEFAULT_PROGRAM: &str = "singularity";

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<ListedInstance>,
}

#[derive(Debug, Deserialize)]
struct ListedInstance {
    instance: String,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    img: String,
    #[serde(default)]
    ip: String,
}

impl From<ListedInstance> for InstanceInfo {
    fn from(listed: ListedInstance) -> Self {
        InstanceInfo {
            name: listed.instance,
            pid: listed.pid,
            ip: listed.ip.parse().ok(),
            image: PathBuf::from(listed.img),
        }
    }
}

/// Output handling for a spawned command
#[derive(Clone, Copy, PartialEq, Eq)]
enum Echo {
    /// Print each line as it arrives
    Stream,
    /// Collect silently
    Quiet,
}

#[derive(Clone, Copy)]
enum Stream {
    Out,
    Err,
}

/// Read `reader` line by line, replacing invalid UTF-8
async fn read_lines<R>(reader: R, echo: Echo, stream: Stream) -> Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if echo == Echo::Stream {
            match stream {
                Stream::Out => println!("{}", line),
                Stream::Err => eprintln!("{}", line),
            }
        }
        lines.push(line);
    }

    Ok(lines)
}

/// `singularity` (or a compatible program such as `apptainer`) invoked as a
/// subprocess
#[derive(Debug, Clone)]
pub struct SingularityCli {
    program: String,
}

impl Default for SingularityCli {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl SingularityCli {
    /// Create a binding for `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, privileged: bool) -> Command {
        if privileged {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.program);
            cmd
        } else {
            Command::new(&self.program)
        }
    }

    fn describe(cmd: &Command) -> String {
        let std_cmd = cmd.as_std();
        std::iter::once(std_cmd.get_program().to_string_lossy().to_string())
            .chain(std_cmd.get_args().map(|a| a.to_string_lossy().to_string()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn execute(&self, mut cmd: Command, echo: Echo) -> Result<CommandOutput> {
        let description = Self::describe(&cmd);
        tracing::debug!("{}", description);

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ComposeError::Runtime(format!("Failed to run {}: {}", description, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ComposeError::Runtime("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ComposeError::Runtime("stderr was not captured".to_string()))?;

        let errors = tokio::spawn(read_lines(stderr, echo, Stream::Err));
        let output = read_lines(stdout, echo, Stream::Out).await;

        // reap the child even when reading failed
        let status = child.wait().await?;
        let stdout = output?;
        let stderr = errors
            .await
            .map_err(|e| ComposeError::Runtime(format!("stderr reader failed: {}", e)))??;

        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn checked(&self, cmd: Command, echo: Echo) -> Result<CommandOutput> {
        let description = Self::describe(&cmd);
        let output = self.execute(cmd, echo).await?;
        if !output.success() {
            return Err(ComposeError::RuntimeCommand {
                command: description,
                status: output.status,
            });
        }
        Ok(output)
    }

    async fn list_as(&self, privileged: bool) -> Result<Vec<InstanceInfo>> {
        let mut cmd = self.command(privileged);
        cmd.args(["instance", "list", "--json"]);

        let output = self.checked(cmd, Echo::Quiet).await?;
        for warning in &output.stderr {
            tracing::debug!("{}", warning);
        }

        let json = output.stdout.join("\n");
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }

        let list: InstanceList = serde_json::from_str(&json)?;
        Ok(list.instances.into_iter().map(InstanceInfo::from).collect())
    }
}

impl ContainerRuntime for SingularityCli {
    fn program(&self) -> &str {
        &self.program
    }

    async fn build(&self, request: &BuildRequest) -> Result<CommandOutput> {
        let mut cmd = self.command(request.privileged);
        cmd.arg("build")
            .args(&request.options)
            .arg(&request.image)
            .arg(&request.recipe)
            .current_dir(&request.context);

        self.execute(cmd, Echo::Stream).await
    }

    async fn pull(&self, uri: &str, dest: &Path) -> Result<()> {
        let mut cmd = self.command(false);
        cmd.arg("pull").arg(dest).arg(uri);

        self.checked(cmd, Echo::Stream).await.map(|_| ())
    }

    async fn start_instance(&self, request: &StartRequest) -> Result<RuntimeHandle> {
        let mut cmd = self.command(request.privileged);
        cmd.args(["instance", "start"])
            .args(&request.options)
            .arg(&request.image)
            .arg(&request.name)
            .args(&request.args);

        self.checked(cmd, Echo::Stream).await?;

        let pid = self
            .list_as(request.privileged)
            .await?
            .into_iter()
            .find(|i| i.name == request.name)
            .and_then(|i| i.pid);

        Ok(RuntimeHandle {
            name: request.name.clone(),
            privileged: request.privileged,
            pid,
        })
    }

    async fn stop_instance(&self, handle: &RuntimeHandle, timeout: Option<Duration>) -> Result<()> {
        let mut cmd = self.command(handle.privileged);
        cmd.args(["instance", "stop"]);
        if let Some(timeout) = timeout {
            cmd.arg("--timeout").arg(timeout.as_secs().to_string());
        }
        cmd.arg(&handle.name);

        self.checked(cmd, Echo::Quiet).await.map(|_| ())
    }

    async fn list_instances(&self, privileged: bool) -> Result<Vec<InstanceInfo>> {
        self.list_as(privileged).await
    }

    async fn exec(
        &self,
        handle: &RuntimeHandle,
        command: &[String],
        options: &[String],
    ) -> Result<CommandOutput> {
        let mut cmd = self.command(handle.privileged);
        cmd.arg("exec").args(options).arg(handle.uri()).args(command);

        self.execute(cmd, Echo::Stream).await
    }

    async fn run(
        &self,
        handle: &RuntimeHandle,
        args: &[String],
        options: &[String],
    ) -> Result<CommandOutput> {
        let mut cmd = self.command(handle.privileged);
        cmd.arg("run").args(options).arg(handle.uri()).args(args);

        self.execute(cmd, Echo::Stream).await
    }

    async fn shell(&self, handle: &RuntimeHandle) -> Result<i32> {
        let mut cmd = self.command(handle.privileged);
        cmd.arg("shell")
            .arg(handle.uri())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        tracing::debug!("{}", Self::describe(&cmd));
        let status = cmd.status().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn host_command(&self, command: &[String], cwd: &Path) -> Result<CommandOutput> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ComposeError::Runtime("empty host command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);

        self.execute(cmd, Echo::Quiet).await
    }

    fn log_dir(&self, privileged: bool) -> PathBuf {
        let (home, user) = if privileged {
            (PathBuf::from("/root"), "root".to_string())
        } else {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
            let user = home
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            (home, user)
        };

        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        home.join(".singularity")
            .join("instances")
            .join("logs")
            .join(hostname)
            .join(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance_list() {
        let json = r#"{
  "instances": [
    {
      "instance": "app",
      "pid": 4242,
      "img": "/work/app/app.sif",
      "ip": "10.22.0.2",
      "logErrPath": "/home/u/.singularity/instances/logs/h/u/app.err",
      "logOutPath": "/home/u/.singularity/instances/logs/h/u/app.out"
    },
    {
      "instance": "db",
      "pid": 4343,
      "img": "/work/db/db.sif",
      "ip": ""
    }
  ]
}"#;

        let list: InstanceList = serde_json::from_str(json).unwrap();
        let infos: Vec<InstanceInfo> = list.instances.into_iter().map(InstanceInfo::from).collect();

        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "app");
        assert_eq!(infos[0].pid, Some(4242));
        assert_eq!(infos[0].ip, Some("10.22.0.2".parse().unwrap()));
        assert_eq!(infos[1].ip, None);
    }

    #[test]
    fn test_privileged_command_uses_sudo() {
        let cli = SingularityCli::new("apptainer");
        let mut cmd = cli.command(true);
        cmd.args(["instance", "list"]);
        assert_eq!(SingularityCli::describe(&cmd), "sudo apptainer instance list");
        assert_eq!(cli.program(), "apptainer");
    }

    #[test]
    fn test_log_dir_privileged() {
        let cli = SingularityCli::default();
        let dir = cli.log_dir(true);
        assert!(dir.starts_with("/root/.singularity/instances/logs"));
        assert!(dir.ends_with("root"));
    }

    #[tokio::test]
    async fn test_host_command_captures_output() {
        let cli = SingularityCli::default();
        let temp = tempfile::tempdir().unwrap();
        let output = cli
            .host_command(&["sh".to_string(), "-c".to_string(), "echo hi; exit 3".to_string()], temp.path())
            .await
            .unwrap();

        assert_eq!(output.status, 3);
        assert_eq!(output.stdout, vec!["hi"]);
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_host_command_tolerates_invalid_utf8() {
        let cli = SingularityCli::default();
        let temp = tempfile::tempdir().unwrap();
        let output = cli
            .host_command(
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    "printf 'ok\\377\\n'; printf 'bad\\377\\n' >&2; exit 0".to_string(),
                ],
                temp.path(),
            )
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, vec!["ok\u{FFFD}"]);
        assert_eq!(output.stderr, vec!["bad\u{FFFD}"]);
    }

    #[tokio::test]
    async fn test_list_ignores_runtime_warnings() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let program = temp.path().join("fake-singularity");
        std::fs::write(
            &program,
            "#!/bin/sh\n\
             echo '{\"instances\":[{\"instance\":\"db\",\"pid\":77,\"img\":\"/w/db.sif\",\"ip\":\"10.22.0.2\"}]}'\n\
             echo 'WARNING: underlay of /etc/localtime required more than 50 bind mounts' >&2\n",
        )
        .unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cli = SingularityCli::new(program.to_string_lossy());
        let instances = cli.list_instances(false).await.unwrap();

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "db");
        assert_eq!(instances[0].pid, Some(77));
        assert_eq!(instances[0].ip, Some("10.22.0.2".parse().unwrap()));
    }
}
