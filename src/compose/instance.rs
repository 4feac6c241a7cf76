//! Lifecycle of a single compose instance

use super::config::{option_flags, CommandLine, ServiceSpec};
use crate::error::{ComposeError, Result};
use crate::runtime::{
    BuildRequest, CommandOutput, ContainerRuntime, InstanceInfo, RuntimeHandle, StartRequest,
};
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Lifecycle phase of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    /// No image artifact yet
    NotBuilt,
    /// Image present, instance not running
    Built,
    /// Instance running
    Created,
    /// Instance stopped by this controller
    Stopped,
}

/// Runtime-observed state of an instance
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    /// Current phase
    pub phase: InstancePhase,
    /// Bridge address, when known
    pub ip_address: Option<Ipv4Addr>,
    /// Resolved image artifact
    pub image_path: PathBuf,
    handle: Option<RuntimeHandle>,
}

impl InstanceRecord {
    /// Handle of the running instance
    pub fn handle(&self) -> Option<&RuntimeHandle> {
        self.handle.as_ref()
    }
}

/// Result of [`InstanceController::build`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The artifact already existed
    AlreadyPresent,
    /// The image was pulled
    Pulled,
    /// The image was built from its recipe
    Built,
    /// The runtime build failed; the instance stays unbuilt
    Failed { suggestion: String },
}

impl BuildOutcome {
    /// Whether an artifact is available afterwards
    pub fn is_available(&self) -> bool {
        !matches!(self, BuildOutcome::Failed { .. })
    }
}

/// Result of [`InstanceController::create`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The instance was already running; nothing was done
    AlreadyRunning,
    /// The instance was started
    Created,
}

/// Options for creating an instance
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Address allocated from the bridge
    pub ip_address: Option<Ipv4Addr>,
    /// Start with a writable tmpfs overlay
    pub writable_tmpfs: bool,
}

/// Instance log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Out,
    Err,
}

impl LogStream {
    /// Both streams, in display order
    pub const ALL: [LogStream; 2] = [LogStream::Out, LogStream::Err];

    fn extension(&self) -> &'static str {
        match self {
            LogStream::Out => "out",
            LogStream::Err => "err",
        }
    }
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Out => write!(f, "OUT"),
            LogStream::Err => write!(f, "ERR"),
        }
    }
}

fn pull_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(docker|library|shub|https?)://").expect("pull pattern is valid")
    })
}

/// Whether `reference` can be pulled by the runtime
pub fn is_pullable(reference: &str) -> bool {
    pull_pattern().is_match(reference)
}

/// Owns one instance's configuration and runtime handle
pub struct InstanceController<R: ContainerRuntime> {
    name: String,
    spec: ServiceSpec,
    working_dir: PathBuf,
    privileged: bool,
    runtime: Arc<R>,
    volumes: Vec<String>,
    record: InstanceRecord,
}

impl<R: ContainerRuntime> InstanceController<R> {
    /// Create a controller. Hook commands containing pipes are rejected.
    pub fn new(
        name: &str,
        spec: ServiceSpec,
        working_dir: &Path,
        privileged: bool,
        runtime: Arc<R>,
    ) -> Result<Self> {
        let hooks: [(&str, Option<&CommandLine>); 3] = [
            ("exec", spec.exec.as_ref().map(|e| &e.command)),
            ("run", spec.run.as_ref().and_then(|r| r.args.as_ref())),
            ("post", spec.post.as_ref().and_then(|p| p.command.as_ref())),
        ];
        for (hook, command) in hooks {
            if command.is_some_and(CommandLine::has_pipe) {
                return Err(ComposeError::UnsupportedPipe {
                    instance: name.to_string(),
                    hook: hook.to_string(),
                });
            }
        }

        let mut controller = Self {
            name: name.to_string(),
            volumes: spec.volumes.clone(),
            spec,
            working_dir: working_dir.to_path_buf(),
            privileged,
            runtime,
            record: InstanceRecord {
                phase: InstancePhase::NotBuilt,
                ip_address: None,
                image_path: PathBuf::new(),
                handle: None,
            },
        };

        controller.record.image_path = controller.image_path();
        if controller.record.image_path.exists() {
            controller.record.phase = InstancePhase::Built;
        }

        Ok(controller)
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance configuration
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Runtime state
    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    /// Volumes bound at create, including inherited and registered ones
    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    /// Add a bind volume unless it is already present
    pub fn register_volume(&mut self, volume: impl Into<String>) {
        let volume = volume.into();
        if !self.volumes.contains(&volume) {
            self.volumes.push(volume);
        }
    }

    /// Share volumes declared by another instance
    pub fn inherit_volumes(&mut self, volumes: &[String]) {
        for volume in volumes {
            self.register_volume(volume.clone());
        }
    }

    fn context_dir(&self) -> PathBuf {
        match &self.spec.build {
            Some(build) => self.working_dir.join(&build.context),
            None => self.working_dir.join(&self.name),
        }
    }

    /// Image artifact: an existing local `image` path as given, otherwise
    /// `<context>/<name>.sif`
    pub fn image_path(&self) -> PathBuf {
        if let Some(image) = &self.spec.image {
            let local = self.working_dir.join(image);
            if local.exists() {
                return local;
            }
        }

        self.context_dir().join(format!("{}.sif", self.name))
    }

    async fn running_info(&self) -> Result<Option<InstanceInfo>> {
        Ok(self
            .runtime
            .list_instances(self.privileged)
            .await?
            .into_iter()
            .find(|info| info.name == self.name))
    }

    /// Whether the runtime reports this instance as running
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.running_info().await?.is_some())
    }

    fn adopt(&mut self, info: InstanceInfo) {
        self.record.handle = Some(RuntimeHandle {
            name: info.name,
            privileged: self.privileged,
            pid: info.pid,
        });
        if info.ip.is_some() {
            self.record.ip_address = info.ip;
        }
        self.record.phase = InstancePhase::Created;
    }

    /// Re-read the instance state from the runtime
    pub async fn refresh(&mut self) -> Result<&InstanceRecord> {
        self.record.image_path = self.image_path();

        match self.running_info().await? {
            Some(info) => self.adopt(info),
            None => {
                self.record.handle = None;
                self.record.phase = match self.record.phase {
                    InstancePhase::Created | InstancePhase::Stopped => InstancePhase::Stopped,
                    _ if self.record.image_path.exists() => InstancePhase::Built,
                    _ => InstancePhase::NotBuilt,
                };
            }
        }

        Ok(&self.record)
    }

    /// Build or pull the image unless the artifact already exists
    pub async fn build(&mut self) -> Result<BuildOutcome> {
        let image = self.image_path();
        self.record.image_path = image.clone();

        if image.exists() {
            tracing::debug!("{} already exists", image.display());
            self.mark_built();
            return Ok(BuildOutcome::AlreadyPresent);
        }

        if let Some(reference) = &self.spec.image {
            if !is_pullable(reference) {
                return Err(ComposeError::InvalidImageReference(reference.clone()));
            }

            let context = self.context_dir();
            if !context.exists() {
                tracing::info!("Creating image context folder for {}", self.name);
                std::fs::create_dir_all(&context)?;
            }

            tracing::info!("Pulling {}", reference);
            self.runtime.pull(reference, &image).await?;
            self.mark_built();
            return Ok(BuildOutcome::Pulled);
        }

        let Some(build) = self.spec.build.clone() else {
            return Err(ComposeError::Config(format!(
                "build or image must be defined for {}",
                self.name
            )));
        };

        let context = self.context_dir();
        if !context.join(&build.recipe).exists() {
            return Err(ComposeError::Config(format!(
                "{} not found for build",
                build.recipe
            )));
        }

        let options = build.flags();
        let privileged = !options.iter().any(|o| o == "--fakeroot" || o == "--remote");

        tracing::info!("Building {}", self.name);
        let request = BuildRequest {
            image: image.clone(),
            recipe: build.recipe.clone(),
            context,
            options,
            privileged,
        };

        let succeeded = match self.runtime.build(&request).await {
            Ok(output) => output.success() && image.exists(),
            Err(e) => {
                tracing::debug!("Build of {} failed: {}", self.name, e);
                false
            }
        };

        if succeeded {
            self.mark_built();
            return Ok(BuildOutcome::Built);
        }

        let basename = image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let suggestion = format!(
            "sudo {} build {} {}",
            self.runtime.program(),
            basename,
            build.recipe
        );
        tracing::warn!(
            "{}",
            ComposeError::BuildExecution {
                instance: self.name.clone(),
                suggestion: suggestion.clone(),
            }
        );

        self.record.phase = InstancePhase::NotBuilt;
        Ok(BuildOutcome::Failed { suggestion })
    }

    fn mark_built(&mut self) {
        if self.record.phase == InstancePhase::NotBuilt {
            self.record.phase = InstancePhase::Built;
        }
    }

    /// `--bind` options for every volume.
    ///
    /// A relative source is looked up in the working directory, then in the
    /// instance's own subdirectory.
    pub fn bind_options(&self) -> Result<Vec<String>> {
        let mut binds = Vec::with_capacity(self.volumes.len() * 2);

        for volume in &self.volumes {
            let mut parts = volume.splitn(3, ':');
            let src = parts.next().unwrap_or_default();
            if src.is_empty() {
                return Err(ComposeError::BindSourceNotFound(volume.clone()));
            }
            let dest = parts.next().unwrap_or(src);
            let opts = parts.next();

            let source = [
                self.working_dir.join(src),
                self.working_dir.join(&self.name).join(src),
            ]
            .into_iter()
            .find(|candidate| candidate.exists())
            .ok_or_else(|| ComposeError::BindSourceNotFound(src.to_string()))?;

            let dest = Path::new("/").join(dest);
            let mut bind = format!("{}:{}", source.display(), dest.display());
            if let Some(opts) = opts {
                bind.push(':');
                bind.push_str(opts);
            }

            binds.push("--bind".to_string());
            binds.push(bind);
        }

        Ok(binds)
    }

    /// Network options: `--net`, port mappings and the allocated address.
    ///
    /// Without root or fakeroot the runtime cannot set up a bridge, so the
    /// instance falls back to `--network none`.
    pub fn network_options(&self, ip_address: Option<Ipv4Addr>) -> Vec<String> {
        let mut options = vec!["--net".to_string()];

        if !self.privileged && !self.spec.start.is_fakeroot() {
            options.push("--network".to_string());
            options.push("none".to_string());
        }

        for port in &self.spec.ports {
            options.push("--network-args".to_string());
            options.push(format!("portmap={}/tcp", port));
        }

        if let Some(ip) = ip_address.filter(|_| self.spec.network.allocate_ip) {
            options.push("--network-args".to_string());
            options.push(format!("IP={}", ip));
        }

        options
    }

    /// Full option list for `instance start`
    pub fn start_options(&self, options: &CreateOptions) -> Result<Vec<String>> {
        let mut start = self.bind_options()?;
        start.extend(self.spec.start.flags());

        if self.spec.network.enable {
            start.extend(self.network_options(options.ip_address));
        }

        start.push("--hostname".to_string());
        start.push(self.name.clone());

        if options.writable_tmpfs {
            start.push("--writable-tmpfs".to_string());
        }

        Ok(start)
    }

    /// Start the instance and run its exec, run and post hooks.
    ///
    /// A running instance is left untouched and none of its hooks run.
    pub async fn create(&mut self, options: &CreateOptions) -> Result<CreateOutcome> {
        let image = self.image_path();
        if !image.exists() {
            return Err(ComposeError::ImageNotBuilt(image));
        }
        self.record.image_path = image.clone();

        if let Some(info) = self.running_info().await? {
            tracing::info!("{} is already running", self.name);
            self.adopt(info);
            return Ok(CreateOutcome::AlreadyRunning);
        }

        tracing::info!("Creating {}", self.name);

        let request = StartRequest {
            name: self.name.clone(),
            image,
            options: self.start_options(options)?,
            args: self
                .spec
                .start
                .args
                .as_ref()
                .map(CommandLine::to_args)
                .unwrap_or_default(),
            privileged: self.privileged,
        };

        let handle = self.runtime.start_instance(&request).await?;
        self.record.handle = Some(handle.clone());
        self.record.phase = InstancePhase::Created;
        if self.spec.network.enable {
            self.record.ip_address = options.ip_address;
        }

        if let Some(exec) = &self.spec.exec {
            let command = exec.command.to_args();
            let output = self
                .runtime
                .exec(&handle, &command, &option_flags(&exec.options))
                .await?;
            check_status(format!("exec {} {}", handle.uri(), exec.command), &output)?;
        }

        if let Some(run) = &self.spec.run {
            let args = run.args.as_ref().map(CommandLine::to_args).unwrap_or_default();
            let output = self
                .runtime
                .run(&handle, &args, &option_flags(&run.options))
                .await?;
            check_status(format!("run {}", handle.uri()), &output)?;
        }

        self.run_post().await?;

        Ok(CreateOutcome::Created)
    }

    /// Build the image if needed, then create the instance
    pub async fn up(&mut self, options: &CreateOptions) -> Result<CreateOutcome> {
        self.build().await?;
        self.create(options).await
    }

    /// Run the post hook on the host, in the working directory
    pub async fn run_post(&self) -> Result<()> {
        let Some(command) = self.spec.post.as_ref().and_then(|p| p.command.as_ref()) else {
            return Ok(());
        };

        let args = command.to_args();
        if args.is_empty() {
            return Ok(());
        }

        tracing::debug!("Running post command for {}: {}", self.name, command);
        let output = self.runtime.host_command(&args, &self.working_dir).await?;
        tracing::debug!("{}", output.text());

        if !output.success() {
            return Err(ComposeError::PostHook {
                instance: self.name.clone(),
                status: output.status,
                output: output.text(),
            });
        }

        Ok(())
    }

    /// Stop the instance if it is running. Returns whether anything was
    /// stopped.
    pub async fn stop(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.record.handle.is_none() {
            if let Some(info) = self.running_info().await? {
                self.adopt(info);
            }
        }

        let Some(handle) = self.record.handle.take() else {
            return Ok(false);
        };

        tracing::info!("Stopping {}", self.name);
        self.runtime.stop_instance(&handle, timeout).await?;
        self.record.phase = InstancePhase::Stopped;
        self.record.ip_address = None;

        Ok(true)
    }

    async fn require_handle(&mut self) -> Result<RuntimeHandle> {
        if self.record.handle.is_none() {
            self.refresh().await?;
        }

        self.record
            .handle
            .clone()
            .ok_or_else(|| ComposeError::InstanceNotRunning(self.name.clone()))
    }

    /// Execute a command in the running instance
    pub async fn execute(&mut self, command: &[String]) -> Result<CommandOutput> {
        let handle = self.require_handle().await?;
        let output = self.runtime.exec(&handle, command, &[]).await?;
        check_status(format!("exec {} {}", handle.uri(), command.join(" ")), &output)?;
        Ok(output)
    }

    /// Run the runscript of the running instance with its configured
    /// arguments
    pub async fn run(&mut self) -> Result<CommandOutput> {
        let handle = self.require_handle().await?;
        let (args, options) = match &self.spec.run {
            Some(run) => (
                run.args.as_ref().map(CommandLine::to_args).unwrap_or_default(),
                option_flags(&run.options),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let output = self.runtime.run(&handle, &args, &options).await?;
        check_status(format!("run {}", handle.uri()), &output)?;
        Ok(output)
    }

    /// Open an interactive shell in the running instance
    pub async fn shell(&mut self) -> Result<i32> {
        let handle = self.require_handle().await?;
        self.runtime.shell(&handle).await
    }

    fn log_path(&self, stream: LogStream) -> PathBuf {
        self.runtime
            .log_dir(self.privileged)
            .join(format!("{}.{}", self.name, stream.extension()))
    }

    /// Contents of the output and error logs, optionally clipped to the
    /// last `tail` lines. Missing logs are skipped.
    pub async fn logs(&self, tail: Option<usize>) -> Result<Vec<(LogStream, String)>> {
        let mut logs = Vec::new();

        for stream in LogStream::ALL {
            let path = self.log_path(stream);

            let content = if self.privileged {
                let command = vec!["sudo".to_string(), "cat".to_string(), path.display().to_string()];
                let output = self.runtime.host_command(&command, &self.working_dir).await?;
                if !output.success() {
                    continue;
                }
                output.text()
            } else {
                if !path.exists() {
                    continue;
                }
                std::fs::read_to_string(&path)?
            };

            logs.push((stream, clip(&content, tail)));
        }

        Ok(logs)
    }

    /// Truncate both logs
    pub async fn clear_logs(&self) -> Result<()> {
        for stream in LogStream::ALL {
            let path = self.log_path(stream);

            if self.privileged {
                let command = vec![
                    "sudo".to_string(),
                    "truncate".to_string(),
                    "-s".to_string(),
                    "0".to_string(),
                    path.display().to_string(),
                ];
                self.runtime.host_command(&command, &self.working_dir).await?;
            } else if path.exists() {
                std::fs::File::create(&path)?;
            }
        }

        tracing::debug!("Cleared logs for {}", self.name);
        Ok(())
    }
}

fn check_status(command: String, output: &CommandOutput) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(ComposeError::RuntimeCommand {
            command,
            status: output.status,
        })
    }
}

fn clip(content: &str, tail: Option<usize>) -> String {
    match tail {
        Some(n) if n > 0 => {
            let lines: Vec<&str> = content.lines().collect();
            lines[lines.len().saturating_sub(n)..].join("\n")
        }
        _ => content.trim_end_matches('\n').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{InMemoryRuntime, RuntimeCall};
    use tempfile::{tempdir, TempDir};

    fn service(yaml: &str) -> ServiceSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn setup() -> (TempDir, Arc<InMemoryRuntime>) {
        let temp = tempdir().unwrap();
        let logs = temp.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        let runtime = Arc::new(InMemoryRuntime::new(logs));
        (temp, runtime)
    }

    fn controller(
        temp: &TempDir,
        runtime: &Arc<InMemoryRuntime>,
        name: &str,
        yaml: &str,
    ) -> InstanceController<InMemoryRuntime> {
        InstanceController::new(name, service(yaml), temp.path(), false, runtime.clone()).unwrap()
    }

    fn started_options(runtime: &InMemoryRuntime, name: &str) -> Vec<String> {
        runtime
            .calls()
            .unwrap()
            .into_iter()
            .find_map(|call| match call {
                RuntimeCall::Start { name: n, options, .. } if n == name => Some(options),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_pullable_references() {
        assert!(is_pullable("docker://nginx"));
        assert!(is_pullable("library://busybox:latest"));
        assert!(is_pullable("shub://vsoch/hello-world"));
        assert!(is_pullable("https://example.org/app.sif"));
        assert!(!is_pullable("nginx"));
        assert!(!is_pullable("oras://registry/app"));
    }

    #[tokio::test]
    async fn test_build_pulls_once() {
        let (temp, runtime) = setup();
        let mut app = controller(&temp, &runtime, "app", "image: docker://nginx");
        assert_eq!(app.record().phase, InstancePhase::NotBuilt);

        assert_eq!(app.build().await.unwrap(), BuildOutcome::Pulled);
        assert_eq!(app.build().await.unwrap(), BuildOutcome::AlreadyPresent);
        assert_eq!(app.record().phase, InstancePhase::Built);
        assert_eq!(app.image_path(), temp.path().join("app").join("app.sif"));

        let pulls = runtime
            .calls()
            .unwrap()
            .into_iter()
            .filter(|c| matches!(c, RuntimeCall::Pull { .. }))
            .count();
        assert_eq!(pulls, 1);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_reference() {
        let (temp, runtime) = setup();
        let mut app = controller(&temp, &runtime, "app", "image: not-an-image.sif");

        assert!(matches!(
            app.build().await,
            Err(ComposeError::InvalidImageReference(r)) if r == "not-an-image.sif"
        ));
        assert!(runtime.calls().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_image_used_as_is() {
        let (temp, runtime) = setup();
        std::fs::write(temp.path().join("local.sif"), b"SIF").unwrap();
        let mut app = controller(&temp, &runtime, "app", "image: local.sif");

        assert_eq!(app.image_path(), temp.path().join("local.sif"));
        assert_eq!(app.build().await.unwrap(), BuildOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_build_from_recipe() {
        let (temp, runtime) = setup();
        std::fs::create_dir_all(temp.path().join("app")).unwrap();
        std::fs::write(temp.path().join("app/Singularity"), "Bootstrap: docker\n").unwrap();

        let mut app = controller(
            &temp,
            &runtime,
            "app",
            "build:\n  context: app\n  options:\n    - fakeroot\n",
        );

        assert_eq!(app.build().await.unwrap(), BuildOutcome::Built);
        match &runtime.calls().unwrap()[0] {
            RuntimeCall::Build {
                options,
                privileged,
                ..
            } => {
                assert_eq!(options, &vec!["--fakeroot".to_string()]);
                assert!(!privileged);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_build_failure_is_not_fatal() {
        let (temp, runtime) = setup();
        std::fs::create_dir_all(temp.path().join("app")).unwrap();
        std::fs::write(temp.path().join("app/Singularity"), "Bootstrap: docker\n").unwrap();
        runtime.fail_build(temp.path().join("app/app.sif")).unwrap();

        let mut app = controller(&temp, &runtime, "app", "build:\n  context: app\n");

        match app.build().await.unwrap() {
            BuildOutcome::Failed { suggestion } => {
                assert_eq!(suggestion, "sudo singularity build app.sif Singularity")
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(app.record().phase, InstancePhase::NotBuilt);
        assert!(matches!(
            app.create(&CreateOptions::default()).await,
            Err(ComposeError::ImageNotBuilt(_))
        ));
    }

    #[tokio::test]
    async fn test_create_options() {
        let (temp, runtime) = setup();
        std::fs::create_dir_all(temp.path().join("app/data")).unwrap();
        let mut app = controller(
            &temp,
            &runtime,
            "app",
            "image: docker://nginx\nports: [\"80\"]\nvolumes: [\"data:/var/data:ro\"]\nstart:\n  options: [containall]\n",
        );
        app.build().await.unwrap();

        let outcome = app
            .create(&CreateOptions {
                ip_address: Some(Ipv4Addr::new(10, 22, 0, 2)),
                writable_tmpfs: true,
            })
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
        assert_eq!(app.record().phase, InstancePhase::Created);

        let bind = format!("{}:/var/data:ro", temp.path().join("app/data").display());
        assert_eq!(
            started_options(&runtime, "app"),
            vec![
                "--bind",
                bind.as_str(),
                "--containall",
                "--net",
                "--network",
                "none",
                "--network-args",
                "portmap=80/tcp",
                "--network-args",
                "IP=10.22.0.2",
                "--hostname",
                "app",
                "--writable-tmpfs",
            ]
        );
    }

    #[tokio::test]
    async fn test_network_disabled_and_no_allocation() {
        let (temp, runtime) = setup();
        let privileged = InstanceController::new(
            "db",
            service("image: docker://postgres\nnetwork:\n  allocate_ip: false\n"),
            temp.path(),
            true,
            runtime.clone(),
        )
        .unwrap();
        assert_eq!(
            privileged.network_options(Some(Ipv4Addr::new(10, 22, 0, 3))),
            vec!["--net"]
        );

        let mut offline = controller(
            &temp,
            &runtime,
            "offline",
            "image: docker://busybox\nnetwork:\n  enable: false\n",
        );
        offline.build().await.unwrap();
        offline
            .create(&CreateOptions {
                ip_address: Some(Ipv4Addr::new(10, 22, 0, 4)),
                writable_tmpfs: false,
            })
            .await
            .unwrap();
        assert_eq!(started_options(&runtime, "offline"), vec!["--hostname", "offline"]);
        assert_eq!(offline.record().ip_address, None);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (temp, runtime) = setup();
        let mut app = controller(
            &temp,
            &runtime,
            "app",
            "image: docker://nginx\npost:\n  command: touch marker\n",
        );

        app.up(&CreateOptions::default()).await.unwrap();
        let second = app.create(&CreateOptions::default()).await.unwrap();
        assert_eq!(second, CreateOutcome::AlreadyRunning);

        let calls = runtime.calls().unwrap();
        let starts = calls
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Start { .. }))
            .count();
        let hosts = calls
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Host { .. }))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(hosts, 1);
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let (temp, runtime) = setup();
        let mut app = controller(
            &temp,
            &runtime,
            "app",
            "image: docker://nginx\nexec:\n  command: echo ready\nrun:\n  args: --serve\npost:\n  command: [\"mkdir\", \"-p\", \"uploads\"]\n",
        );
        app.up(&CreateOptions::default()).await.unwrap();

        let calls: Vec<RuntimeCall> = runtime
            .calls()
            .unwrap()
            .into_iter()
            .skip_while(|c| !matches!(c, RuntimeCall::Start { .. }))
            .skip(1)
            .collect();

        assert_eq!(
            calls,
            vec![
                RuntimeCall::Exec {
                    name: "app".to_string(),
                    command: vec!["echo".to_string(), "ready".to_string()],
                },
                RuntimeCall::Run {
                    name: "app".to_string(),
                    args: vec!["--serve".to_string()],
                },
                RuntimeCall::Host {
                    command: vec!["mkdir".to_string(), "-p".to_string(), "uploads".to_string()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_exec_is_fatal() {
        let (temp, runtime) = setup();
        runtime.set_exec_status(2).unwrap();
        let mut app = controller(
            &temp,
            &runtime,
            "app",
            "image: docker://nginx\nexec:\n  command: exit 2\n",
        );

        assert!(matches!(
            app.up(&CreateOptions::default()).await,
            Err(ComposeError::RuntimeCommand { status: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_post_failure() {
        let (temp, runtime) = setup();
        runtime.set_host_status(1).unwrap();
        let mut app = controller(
            &temp,
            &runtime,
            "app",
            "image: docker://nginx\npost:\n  command: ./setup.sh\n",
        );

        match app.up(&CreateOptions::default()).await {
            Err(ComposeError::PostHook {
                instance, status, ..
            }) => {
                assert_eq!(instance, "app");
                assert_eq!(status, 1);
            }
            other => panic!("expected post failure, got {:?}", other),
        }
    }

    #[test]
    fn test_pipes_rejected() {
        let (temp, runtime) = setup();
        let result = InstanceController::new(
            "app",
            service("image: docker://nginx\nexec:\n  command: cat /etc/hosts | grep app\n"),
            temp.path(),
            false,
            runtime,
        );

        assert!(matches!(
            result,
            Err(ComposeError::UnsupportedPipe { hook, .. }) if hook == "exec"
        ));
    }

    #[tokio::test]
    async fn test_missing_bind_source() {
        let (temp, runtime) = setup();
        let mut app = controller(
            &temp,
            &runtime,
            "app",
            "image: docker://nginx\nvolumes: [\"missing:/data\"]\n",
        );
        app.build().await.unwrap();

        assert!(matches!(
            app.create(&CreateOptions::default()).await,
            Err(ComposeError::BindSourceNotFound(src)) if src == "missing"
        ));
        assert!(runtime.running_names().unwrap().is_empty());
    }

    #[test]
    fn test_empty_bind_source() {
        let (temp, runtime) = setup();
        let app = controller(
            &temp,
            &runtime,
            "app",
            "image: docker://nginx\nvolumes: [\"\"]\n",
        );

        assert!(matches!(
            app.bind_options(),
            Err(ComposeError::BindSourceNotFound(src)) if src.is_empty()
        ));
    }

    #[test]
    fn test_network_fallback_only_skipped_for_fakeroot() {
        let (temp, runtime) = setup();
        let remote = controller(
            &temp,
            &runtime,
            "remote",
            "image: docker://nginx\nstart:\n  options: [remote]\n",
        );
        assert_eq!(remote.network_options(None), vec!["--net", "--network", "none"]);

        let fakeroot = controller(
            &temp,
            &runtime,
            "fakeroot",
            "image: docker://nginx\nstart:\n  options: [f]\n",
        );
        assert_eq!(fakeroot.network_options(None), vec!["--net"]);
    }

    #[tokio::test]
    async fn test_stop_clears_handle() {
        let (temp, runtime) = setup();
        let mut app = controller(&temp, &runtime, "app", "image: docker://nginx");
        app.up(&CreateOptions::default()).await.unwrap();
        assert!(app.record().handle().is_some());

        assert!(app.stop(Some(Duration::from_secs(5))).await.unwrap());
        assert_eq!(app.record().phase, InstancePhase::Stopped);
        assert!(app.record().handle().is_none());
        assert!(!app.exists().await.unwrap());
        assert!(!app.stop(None).await.unwrap());

        assert!(matches!(
            app.execute(&["ls".to_string()]).await,
            Err(ComposeError::InstanceNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_logs_tail_and_clear() {
        let (temp, runtime) = setup();
        let logs = temp.path().join("logs");
        std::fs::write(logs.join("app.out"), "one\ntwo\nthree\n").unwrap();

        let app = controller(&temp, &runtime, "app", "image: docker://nginx");

        let all = app.logs(None).await.unwrap();
        assert_eq!(all, vec![(LogStream::Out, "one\ntwo\nthree".to_string())]);

        let tail = app.logs(Some(2)).await.unwrap();
        assert_eq!(tail[0].1, "two\nthree");

        app.clear_logs().await.unwrap();
        assert_eq!(std::fs::read_to_string(logs.join("app.out")).unwrap(), "");
    }
}
