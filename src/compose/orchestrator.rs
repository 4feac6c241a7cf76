//! Project-wide orchestration of compose instances

use super::config::ProjectConfig;
use super::graph::{DependencyGraph, DependencyPolicy};
use super::instance::{
    BuildOutcome, CreateOptions, CreateOutcome, InstanceController, LogStream,
};
use super::parser::ComposeParser;
use crate::error::{ComposeError, Result};
use crate::network::{AddressAssignment, AddressPool, HostsSynthesizer, DEFAULT_BRIDGE};
use crate::runtime::{CommandOutput, ContainerRuntime, InstanceInfo};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What a create pass does with each instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateAction {
    /// Start from an existing image
    CreateOnly,
    /// Build or pull the image first if it is missing
    BuildThenCreate,
}

/// Options shared by `create`, `up` and `restart`
#[derive(Debug, Clone)]
pub struct UpOptions {
    /// Give instances a writable tmpfs
    pub writable_tmpfs: bool,
    /// Bridge addresses are allocated from
    pub bridge: String,
    /// Skip the generated hosts and resolver files
    pub no_resolv: bool,
    /// Handling of dependencies outside the requested set
    pub dependencies: DependencyPolicy,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self {
            writable_tmpfs: false,
            bridge: DEFAULT_BRIDGE.to_string(),
            no_resolv: false,
            dependencies: DependencyPolicy::default(),
        }
    }
}

/// Log contents of one instance
pub type InstanceLogs = (String, Vec<(LogStream, String)>);

/// Compose project orchestrator
pub struct ProjectOrchestrator<R: ContainerRuntime> {
    /// Project name
    name: String,
    /// Project working directory
    working_dir: PathBuf,
    /// Validated configuration
    config: ProjectConfig,
    /// `depends_on` graph
    graph: DependencyGraph,
    /// Whether instances run with elevated privileges
    privileged: bool,
    runtime: Arc<R>,
    /// One controller per configured instance, in declaration order
    instances: IndexMap<String, InstanceController<R>>,
    warnings: Vec<String>,
}

impl<R: ContainerRuntime> ProjectOrchestrator<R> {
    /// Validate `config` and set up a controller per instance.
    ///
    /// Fails before touching the runtime if the configuration is invalid or
    /// the dependency graph has a cycle.
    pub fn new(name: &str, config: ProjectConfig, working_dir: &Path, runtime: Arc<R>) -> Result<Self> {
        let warnings = ComposeParser::validate(&config, working_dir)?;
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        let graph = DependencyGraph::from_config(&config);
        graph.order()?;

        let privileged = config.requires_privilege();
        if privileged {
            tracing::debug!("Project {} publishes ports and needs elevated privileges", name);
        }

        let mut instances = IndexMap::with_capacity(config.instances.len());
        for (instance, spec) in &config.instances {
            let controller = InstanceController::new(
                instance,
                spec.clone(),
                working_dir,
                privileged,
                runtime.clone(),
            )?;
            instances.insert(instance.clone(), controller);
        }

        for (instance, spec) in &config.instances {
            for source in &spec.volumes_from {
                let shared = config
                    .get(source)
                    .map(|s| s.volumes.clone())
                    .ok_or_else(|| ComposeError::UnknownInstance(source.clone()))?;
                if let Some(controller) = instances.get_mut(instance) {
                    controller.inherit_volumes(&shared);
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            working_dir: working_dir.to_path_buf(),
            config,
            graph,
            privileged,
            runtime,
            instances,
            warnings,
        })
    }

    /// Project name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Project working directory
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Validated configuration
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Whether the project needs elevated privileges
    pub fn privileged(&self) -> bool {
        self.privileged
    }

    /// Configuration warnings found at load time
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Controller of a configured instance
    pub fn instance(&self, name: &str) -> Option<&InstanceController<R>> {
        self.instances.get(name)
    }

    fn instance_mut(&mut self, name: &str) -> Result<&mut InstanceController<R>> {
        self.instances
            .get_mut(name)
            .ok_or_else(|| ComposeError::UnknownInstance(name.to_string()))
    }

    /// Creation order of every configured instance
    pub fn order(&self) -> Result<Vec<String>> {
        self.graph.order()
    }

    /// Requested names, or every configured name when none are given
    fn resolve_names(&self, names: &[String]) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(self.config.names());
        }

        for name in names {
            if !self.instances.contains_key(name) {
                return Err(ComposeError::UnknownInstance(name.clone()));
            }
        }

        Ok(names.to_vec())
    }

    /// Every instance the runtime reports, including root-owned ones when
    /// the project is privileged
    async fn running(&self) -> Result<IndexMap<String, InstanceInfo>> {
        let mut running = IndexMap::new();

        for info in self.runtime.list_instances(false).await? {
            running.insert(info.name.clone(), info);
        }
        if self.privileged {
            for info in self.runtime.list_instances(true).await? {
                running.insert(info.name.clone(), info);
            }
        }

        Ok(running)
    }

    /// Build or pull images, running each instance's post hook after a
    /// successful build
    pub async fn build(&mut self, names: &[String]) -> Result<Vec<(String, BuildOutcome)>> {
        let requested: HashSet<String> = self.resolve_names(names)?.into_iter().collect();
        let declared = self.config.names();
        let mut outcomes = Vec::new();

        for name in declared.into_iter().filter(|n| requested.contains(n)) {
            let controller = self.instance_mut(&name)?;
            let outcome = controller.build().await?;
            if outcome.is_available() {
                controller.run_post().await?;
            }
            outcomes.push((name, outcome));
        }

        Ok(outcomes)
    }

    /// Create instances from existing images
    pub async fn create(
        &mut self,
        names: &[String],
        options: &UpOptions,
    ) -> Result<Vec<(String, CreateOutcome)>> {
        self.dispatch(CreateAction::CreateOnly, names, options).await
    }

    /// Build missing images, then create instances
    pub async fn up(
        &mut self,
        names: &[String],
        options: &UpOptions,
    ) -> Result<Vec<(String, CreateOutcome)>> {
        self.dispatch(CreateAction::BuildThenCreate, names, options).await
    }

    /// Apply the dependency policy to the requested names
    fn with_dependencies(
        &self,
        requested: Vec<String>,
        running: &HashSet<String>,
        policy: DependencyPolicy,
    ) -> Result<Vec<String>> {
        match policy {
            DependencyPolicy::Require => {
                let unmet = self.graph.unmet_dependencies(&requested, running)?;
                match unmet.into_iter().next() {
                    Some((service, dependency)) => {
                        Err(ComposeError::MissingDependency { service, dependency })
                    }
                    None => Ok(requested),
                }
            }
            DependencyPolicy::Include => {
                let missing = self.graph.missing_dependencies(&requested, running)?;
                if !missing.is_empty() {
                    tracing::info!("Including dependencies: {}", missing.join(", "));
                }
                let mut names = requested;
                names.extend(missing);
                Ok(names)
            }
            DependencyPolicy::Ignore => {
                for (service, dependency) in self.graph.unmet_dependencies(&requested, running)? {
                    tracing::warn!(
                        "{}",
                        ComposeError::MissingDependency { service, dependency }
                    );
                }
                Ok(requested)
            }
        }
    }

    /// Assign addresses for instances that are about to start. Running
    /// instances keep the address they already have.
    fn allocate(
        &self,
        order: &[String],
        running: &IndexMap<String, InstanceInfo>,
        bridge: &str,
    ) -> Result<AddressAssignment> {
        let claimed: AddressAssignment = running
            .values()
            .filter_map(|info| info.ip.map(|ip| (info.name.clone(), ip)))
            .collect();

        let fresh: Vec<String> = order
            .iter()
            .filter(|name| !running.contains_key(*name))
            .cloned()
            .collect();

        let mut assignment = AddressPool::new(bridge, claimed)?.allocate(&fresh)?;
        assignment.retain(|name, _| self.config.instances.contains_key(name));

        Ok(assignment)
    }

    /// Shared create pass: resolve names and dependencies, allocate
    /// addresses and write the hosts file once, then walk the creation
    /// order
    async fn dispatch(
        &mut self,
        action: CreateAction,
        names: &[String],
        options: &UpOptions,
    ) -> Result<Vec<(String, CreateOutcome)>> {
        let requested = self.resolve_names(names)?;
        let running = self.running().await?;
        let running_names: HashSet<String> = running.keys().cloned().collect();

        let requested = self.with_dependencies(requested, &running_names, options.dependencies)?;
        let order = self.graph.order_of(&requested)?;

        let assignment = self.allocate(&order, &running, &options.bridge)?;

        if !options.no_resolv {
            let synthesizer = HostsSynthesizer::new(&self.working_dir);
            let hosts = synthesizer.write_hosts(&assignment)?;
            let resolv = synthesizer.resolv_conf()?;
            let binds = HostsSynthesizer::bind_specs(&hosts, &resolv);

            for name in &order {
                let controller = self.instance_mut(name)?;
                for bind in &binds {
                    controller.register_volume(bind.clone());
                }
            }
        }

        let mut outcomes = Vec::with_capacity(order.len());
        for name in order {
            let create = CreateOptions {
                ip_address: assignment.get(&name).copied(),
                writable_tmpfs: options.writable_tmpfs,
            };

            let controller = self.instance_mut(&name)?;
            let outcome = match action {
                CreateAction::CreateOnly => controller.create(&create).await?,
                CreateAction::BuildThenCreate => controller.up(&create).await?,
            };
            outcomes.push((name, outcome));
        }

        Ok(outcomes)
    }

    /// Stop instances, dependents before their dependencies. Returns the
    /// names that were stopped.
    pub async fn down(&mut self, names: &[String], timeout: Option<Duration>) -> Result<Vec<String>> {
        let requested: HashSet<String> = self.resolve_names(names)?.into_iter().collect();
        let mut stopped = Vec::new();

        for name in self.graph.shutdown_order()? {
            if !requested.contains(&name) {
                continue;
            }
            if self.instance_mut(&name)?.stop(timeout).await? {
                stopped.push(name);
            }
        }

        Ok(stopped)
    }

    /// `down` then `up` over the same instances
    pub async fn restart(
        &mut self,
        names: &[String],
        timeout: Option<Duration>,
        options: &UpOptions,
    ) -> Result<Vec<(String, CreateOutcome)>> {
        self.down(names, timeout).await?;
        self.up(names, options).await
    }

    /// Running instances that belong to this project
    pub async fn ps(&self) -> Result<Vec<InstanceInfo>> {
        Ok(self
            .running()
            .await?
            .into_values()
            .filter(|info| self.instances.contains_key(&info.name))
            .collect())
    }

    /// Instance logs, optionally clipped to the last `tail` lines
    pub async fn logs(&self, names: &[String], tail: Option<usize>) -> Result<Vec<InstanceLogs>> {
        let mut logs = Vec::new();

        for name in self.resolve_names(names)? {
            let controller = self
                .instances
                .get(&name)
                .ok_or_else(|| ComposeError::UnknownInstance(name.clone()))?;
            logs.push((name.clone(), controller.logs(tail).await?));
        }

        Ok(logs)
    }

    /// Truncate instance logs
    pub async fn clear_logs(&self, names: &[String]) -> Result<()> {
        for name in self.resolve_names(names)? {
            if let Some(controller) = self.instances.get(&name) {
                controller.clear_logs().await?;
            }
        }
        Ok(())
    }

    /// Execute a command in a running instance
    pub async fn execute(&mut self, name: &str, command: &[String]) -> Result<CommandOutput> {
        self.instance_mut(name)?.execute(command).await
    }

    /// Run the runscript of a running instance
    pub async fn run(&mut self, name: &str) -> Result<CommandOutput> {
        self.instance_mut(name)?.run().await
    }

    /// Interactive shell in a running instance
    pub async fn shell(&mut self, name: &str) -> Result<i32> {
        self.instance_mut(name)?.shell().await
    }

    /// Configuration as pretty-printed JSON
    pub fn view_config(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.config)?)
    }
}
